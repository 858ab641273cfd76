//! Identity collaborator
//!
//! Password authentication, token refresh and organization lookups against
//! the document database. [`IdentityService`] is the seam; [`HttpBackend`]
//! is the real client.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::environment::IdentityCollection;
use crate::membership::RawMembership;
use crate::session::SessionAuthenticator;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("flint/", env!("CARGO_PKG_VERSION"));

/// Only human accounts carry organization relations
const MEMBERSHIP_COLLECTION: IdentityCollection = IdentityCollection::Users;

/// Errors from external collaborators
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("not a member of organization '{0}'")]
    NotMember(String),

    #[error("service unreachable: {0}")]
    Unreachable(String),
}

impl CollaboratorError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn message_mentions(&self, needles: &[&str]) -> bool {
        let text = self.to_string().to_lowercase();
        needles.iter().any(|n| text.contains(n))
    }

    pub fn is_authentication_error(&self) -> bool {
        self.status_code() == Some(401)
            || self.message_mentions(&["unauthorized", "credentials", "auth token"])
    }

    pub fn is_permission_error(&self) -> bool {
        self.status_code() == Some(403)
            || matches!(self, Self::NotMember(_))
            || self.message_mentions(&["forbidden", "permission", "access denied"])
    }

    /// One-line explanation suitable for end users
    pub fn friendly_message(&self) -> String {
        match self {
            Self::Status { status, message } => match *status {
                400 if message.to_lowercase().contains("failed to authenticate") => {
                    "Invalid email or password. Please check your credentials and try again.".into()
                }
                400 => "Input validation failed. Please check your data and try again.".into(),
                401 => "Authentication required. Please run 'flint auth pb' to authenticate.".into(),
                403 => "Access denied. You don't have permission to perform this action.".into(),
                404 => "The requested resource was not found. It may have been deleted or you may not have access to it.".into(),
                429 => "Rate limit exceeded. Please wait a moment before trying again.".into(),
                503 => "Stone-Age.io service is temporarily unavailable. Please try again later.".into(),
                s if s >= 500 => "Stone-Age.io server error. Please try again later or contact support.".into(),
                _ => message.clone(),
            },
            Self::Http(e) if e.is_timeout() => {
                "The request timed out. Please check the server URL and try again.".into()
            }
            Self::Http(e) if e.is_connect() => {
                "Connection error. Please check your network connection and the Stone-Age.io server URL.".into()
            }
            Self::NotMember(org) => format!(
                "You don't have permission to access organization '{}'. Please contact your organization administrator.",
                org
            ),
            Self::Unreachable(_) => {
                "Could not reach the server to verify access. Please check your connection.".into()
            }
            other => other.to_string(),
        }
    }

    /// Next step to try, if there is an obvious one
    pub fn suggestion(&self) -> Option<&'static str> {
        if self.is_authentication_error() {
            return Some("Try running 'flint auth pb' to authenticate with PocketBase.");
        }
        if self.is_permission_error() {
            if self.message_mentions(&["organization"]) {
                return Some("Verify your organization membership with 'flint environment show' and contact your administrator if needed.");
            }
            return Some("Contact your organization administrator to verify your permissions.");
        }
        match self.status_code() {
            Some(404) => Some("Verify the resource exists and that you have access to it."),
            Some(s) if s >= 500 => Some("This appears to be a server issue. Please try again later or contact support."),
            _ => match self {
                Self::Http(_) | Self::Unreachable(_) => {
                    Some("Check the environment's PocketBase URL with 'flint environment show'.")
                }
                Self::Messaging(_) => Some("Check the NATS servers and credentials with 'flint environment show'."),
                _ => None,
            },
        }
    }
}

/// A successful password authentication or refresh
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub token: String,
    /// Expiry read from the token, when it states one
    pub expires_hint: Option<DateTime<Utc>>,
    pub record: Map<String, Value>,
}

/// Result of checking whether an identity may act within an organization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizationAccess {
    Granted,
    NotMember,
    /// The membership could not be determined
    Unreachable(String),
}

/// Authentication and organization lookups
pub trait IdentityService {
    fn authenticate(
        &self,
        collection: IdentityCollection,
        identity: &str,
        secret: &str,
    ) -> Result<AuthOutcome, CollaboratorError>;

    fn refresh(&self, collection: IdentityCollection, token: &str) -> Result<AuthOutcome, CollaboratorError>;

    /// Raw organizations value of an identity, expanded where possible
    fn fetch_organizations(&self, token: &str, identity_id: &str) -> Result<Value, CollaboratorError>;

    /// Record the organization the identity is currently acting within
    fn update_current_organization(
        &self,
        token: &str,
        identity_id: &str,
        organization_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Check the cached record first, then ask the backend
    fn validate_organization_access(
        &self,
        token: &str,
        record: &Map<String, Value>,
        organization_id: &str,
    ) -> OrganizationAccess {
        let authenticator = SessionAuthenticator::new();
        if let Ok(cached) = authenticator.membership_from_record(Some(record)) {
            if cached.contains(organization_id) {
                return OrganizationAccess::Granted;
            }
        }

        let Some(identity_id) = record.get("id").and_then(Value::as_str) else {
            return OrganizationAccess::Unreachable("identity record has no id".into());
        };

        match self.fetch_organizations(token, identity_id) {
            Ok(raw) => match RawMembership::parse(&raw) {
                Ok(parsed) => {
                    if parsed.normalize().contains(organization_id) {
                        OrganizationAccess::Granted
                    } else {
                        OrganizationAccess::NotMember
                    }
                }
                Err(e) => OrganizationAccess::Unreachable(e.to_string()),
            },
            Err(e) => OrganizationAccess::Unreachable(e.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
    #[serde(default)]
    record: Map<String, Value>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Blocking HTTP client for the document database
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string()).filter(|t| !t.is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn get_request(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.url(path)), self.token.as_deref())
    }

    pub(crate) fn post_request(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(self.url(path)), self.token.as_deref())
    }

    pub(crate) fn patch_request(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.patch(self.url(path)), self.token.as_deref())
    }

    pub(crate) fn delete_request(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.delete(self.url(path)), self.token.as_deref())
    }

    fn authorized(&self, request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and decode a JSON body, mapping non-2xx to `Status`
    pub(crate) fn send_json(&self, request: RequestBuilder) -> Result<Value, CollaboratorError> {
        let response = request.send()?;
        let status = response.status();
        let body = response.text()?;
        debug!(status = status.as_u16(), bytes = body.len(), "backend response");

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| CollaboratorError::Decode(e.to_string()))
    }

    /// GET /api/health
    pub fn health(&self) -> Result<(), CollaboratorError> {
        self.send_json(self.client.get(self.url("health")))
            .map(|_| ())
    }

    fn auth_outcome(&self, body: Value) -> Result<AuthOutcome, CollaboratorError> {
        let parsed: AuthResponse =
            serde_json::from_value(body).map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        Ok(AuthOutcome {
            expires_hint: token_expiry(&parsed.token),
            token: parsed.token,
            record: parsed.record,
        })
    }
}

fn status_error(status: StatusCode, body: &str) -> CollaboratorError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    CollaboratorError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Expiry stated in a JWT's `exp` claim. Signatures are not checked.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

impl IdentityService for HttpBackend {
    fn authenticate(
        &self,
        collection: IdentityCollection,
        identity: &str,
        secret: &str,
    ) -> Result<AuthOutcome, CollaboratorError> {
        debug!(collection = %collection, "authenticating");
        let path = format!("collections/{}/auth-with-password", collection);
        let request = self
            .authorized(self.client.post(self.url(&path)), None)
            .json(&json!({ "identity": identity, "password": secret }));
        let outcome = self.auth_outcome(self.send_json(request)?)?;
        debug!("authentication succeeded");
        Ok(outcome)
    }

    fn refresh(&self, collection: IdentityCollection, token: &str) -> Result<AuthOutcome, CollaboratorError> {
        debug!(collection = %collection, "refreshing token");
        let path = format!("collections/{}/auth-refresh", collection);
        let request = self.authorized(self.client.post(self.url(&path)), Some(token));
        self.auth_outcome(self.send_json(request)?)
    }

    fn fetch_organizations(&self, token: &str, identity_id: &str) -> Result<Value, CollaboratorError> {
        debug!(identity = identity_id, "fetching organizations");
        let path = format!("collections/{}/records/{}", MEMBERSHIP_COLLECTION, identity_id);
        let request = self
            .authorized(self.client.get(self.url(&path)), Some(token))
            .query(&[("expand", "organizations")]);
        let record = self.send_json(request)?;

        let expanded = record
            .get("expand")
            .and_then(|e| e.get("organizations"))
            .filter(|v| !v.is_null());
        Ok(expanded
            .or_else(|| record.get("organizations"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn update_current_organization(
        &self,
        token: &str,
        identity_id: &str,
        organization_id: &str,
    ) -> Result<(), CollaboratorError> {
        debug!(identity = identity_id, organization = organization_id, "updating current organization");
        let path = format!("collections/{}/records/{}", MEMBERSHIP_COLLECTION, identity_id);
        let request = self
            .authorized(self.client.patch(self.url(&path)), Some(token))
            .json(&json!({ "current_organization_id": organization_id }));
        self.send_json(request).map(|_| ())
    }
}
