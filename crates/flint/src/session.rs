//! Session lifecycle
//!
//! Decides whether a cached session can be used, and which organization a
//! freshly authenticated identity should act within. Nothing here performs
//! I/O; callers pass in what the backend returned.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::environment::Session;
use crate::identity::AuthOutcome;
use crate::membership::{OrganizationMembership, RawMembership};

/// Tokens are treated as expired this long before their stated expiry
pub const EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Lifetime assumed when the backend does not state one
pub const DEFAULT_TOKEN_LIFETIME_DAYS: i64 = 7;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("authentication expired at {}", expires.format("%Y-%m-%d %H:%M:%S UTC"))]
    Expired { expires: DateTime<Utc> },

    #[error("not a member of organization '{requested}'. Available: {}", available.join(", "))]
    OrganizationMismatch {
        requested: String,
        available: Vec<String>,
    },

    #[error("unrecognized organization membership shape: {0}")]
    UnrecognizedMembershipShape(String),
}

/// Where a session stands relative to its expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// Usable; `None` means no expiry was recorded
    Valid { expires: Option<DateTime<Utc>> },
    /// Inside the buffer window before expiry
    NearExpiry { expires: DateTime<Utc> },
    Expired { expires: DateTime<Utc> },
}

impl SessionState {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Valid { .. } => "valid",
            Self::NearExpiry { .. } => "expiring",
            Self::Expired { .. } => "expired",
        }
    }
}

/// How an organization was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Requested by the caller and confirmed as a member
    Explicit,
    /// The identity belongs to exactly one organization
    SoleMembership,
    /// A previously stored choice that is still a membership
    PreviouslyStored,
    /// Several candidates and nothing to go on
    RequiresPrompt,
    /// No membership at all
    None,
}

/// Result of organization selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationSelection {
    pub organization_id: Option<String>,
    pub mode: SelectionMode,
    pub candidates: OrganizationMembership,
}

/// Time source for expiry checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Fixed(at) => *at,
        }
    }
}

/// Session validity and organization selection
#[derive(Debug, Clone, Default)]
pub struct SessionAuthenticator {
    clock: Clock,
}

impl SessionAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Usable right now
    pub fn is_session_valid(&self, session: &Session) -> bool {
        self.is_session_valid_at(session, self.now())
    }

    /// Usable at `now`: a token, and either no expiry or `now` before the buffer
    pub fn is_session_valid_at(&self, session: &Session, now: DateTime<Utc>) -> bool {
        self.session_state_at(session, now).is_usable()
    }

    pub fn session_state(&self, session: &Session) -> SessionState {
        self.session_state_at(session, self.now())
    }

    pub fn session_state_at(&self, session: &Session, now: DateTime<Utc>) -> SessionState {
        if !session.is_authenticated() {
            return SessionState::Unauthenticated;
        }
        let Some(expires) = session.expires else {
            return SessionState::Valid { expires: None };
        };

        // An expiry too close to the start of time to subtract the buffer from counts as expired
        match expires.checked_sub_signed(Duration::minutes(EXPIRY_BUFFER_MINUTES)) {
            _ if now >= expires => SessionState::Expired { expires },
            None => SessionState::Expired { expires },
            Some(usable_until) if now >= usable_until => SessionState::NearExpiry { expires },
            Some(_) => SessionState::Valid {
                expires: Some(expires),
            },
        }
    }

    /// Fail unless the session can be sent to the backend. Never refreshes.
    pub fn ensure_usable(&self, session: &Session) -> Result<(), SessionError> {
        match self.session_state(session) {
            SessionState::Valid { .. } => Ok(()),
            SessionState::Unauthenticated => Err(SessionError::Unauthenticated),
            SessionState::NearExpiry { expires } | SessionState::Expired { expires } => {
                Err(SessionError::Expired { expires })
            }
        }
    }

    pub fn normalize_membership(&self, raw: &Value) -> Result<OrganizationMembership, SessionError> {
        Ok(RawMembership::parse(raw)?.normalize())
    }

    /// Choose the organization for a fresh session.
    ///
    /// A non-empty `requested` id either matches a membership or fails; it
    /// never falls through to the other rules.
    pub fn select_organization(
        &self,
        membership: &OrganizationMembership,
        requested: Option<&str>,
        previously_stored: Option<&str>,
    ) -> Result<OrganizationSelection, SessionError> {
        let selection = |organization_id: Option<&str>, mode| OrganizationSelection {
            organization_id: organization_id.map(str::to_string),
            mode,
            candidates: membership.clone(),
        };

        if let Some(requested) = requested.filter(|r| !r.is_empty()) {
            if !membership.contains(requested) {
                return Err(SessionError::OrganizationMismatch {
                    requested: requested.to_string(),
                    available: membership.ids().into_iter().map(str::to_string).collect(),
                });
            }
            return Ok(selection(Some(requested), SelectionMode::Explicit));
        }

        if membership.is_empty() {
            return Ok(selection(None, SelectionMode::None));
        }

        if membership.len() == 1 {
            let sole = membership.ids()[0];
            return Ok(selection(Some(sole), SelectionMode::SoleMembership));
        }

        if let Some(stored) = previously_stored.filter(|s| membership.contains(s)) {
            return Ok(selection(Some(stored), SelectionMode::PreviouslyStored));
        }

        Ok(selection(None, SelectionMode::RequiresPrompt))
    }

    /// The session that replaces whatever was cached before
    pub fn authenticated_session(&self, outcome: &AuthOutcome) -> Session {
        Session {
            token: outcome.token.clone(),
            expires: Some(
                outcome
                    .expires_hint
                    .unwrap_or_else(|| self.now() + Duration::days(DEFAULT_TOKEN_LIFETIME_DAYS)),
            ),
            record: Some(outcome.record.clone()),
        }
    }

    /// Membership from an identity record: `expand.organizations`, then
    /// `organizations`. A record without either has no membership.
    pub fn membership_from_record(
        &self,
        record: Option<&Map<String, Value>>,
    ) -> Result<OrganizationMembership, SessionError> {
        let Some(record) = record else {
            return Ok(OrganizationMembership::default());
        };

        let expanded = record
            .get("expand")
            .and_then(|e| e.get("organizations"))
            .filter(|v| !v.is_null());

        match expanded.or_else(|| record.get("organizations")) {
            Some(raw) => self.normalize_membership(raw),
            None => Ok(OrganizationMembership::default()),
        }
    }
}

/// The organization the backend last recorded for this identity
pub fn current_organization_hint(record: Option<&Map<String, Value>>) -> Option<String> {
    record?
        .get("current_organization_id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
