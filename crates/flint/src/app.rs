//! Dispatcher
//!
//! [`App`] owns the loaded preferences, the store, the resolver and the
//! session authenticator. Each CLI operation is a method returning data for
//! the caller to render. Collaborators are passed in per call, so the same
//! flows run against fakes in tests.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::environment::{
    Environment, IdentityCollection, MessagingAuth, MessagingMethod,
};
use crate::identity::{CollaboratorError, IdentityService, OrganizationAccess};
use crate::membership::OrganizationMembership;
use crate::preferences::{GlobalPreferences, PreferenceOverrides};
use crate::records::{validate_record_data, ListOptions, RecordList, RecordService};
use crate::resolver::{CommandResolver, COLLECTIONS};
use crate::session::{
    current_organization_hint, SelectionMode, SessionAuthenticator, SessionError, SessionState,
};
use crate::store::{ConfigStore, StoreError};

/// Arguments for `environment create`
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub name: String,
    pub backend_url: String,
    pub servers: Vec<String>,
    pub auth_collection: IdentityCollection,
    pub organization_id: Option<String>,
    pub messaging_method: MessagingMethod,
}

/// One row of `environment list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSummary {
    pub name: String,
    pub active: bool,
    pub url: String,
    pub auth_collection: IdentityCollection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub session: String,
}

/// Credentials for `auth pb`
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub identity: String,
    pub secret: String,
    pub collection: Option<IdentityCollection>,
    pub organization: Option<String>,
}

/// Result of `auth pb`
#[derive(Debug, Clone, Serialize)]
pub struct LoginSummary {
    pub environment: String,
    pub collection: IdentityCollection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip)]
    pub selection: Option<SelectionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// Result of `environment organization`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationUpdate {
    pub environment: String,
    pub organization_id: String,
    /// False when the session was stale and the change is local only
    pub validated: bool,
}

/// Arguments for `auth nats`; missing values fall back to what is stored
#[derive(Debug, Clone, Default)]
pub struct MessagingUpdate {
    pub method: Option<MessagingMethod>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub creds_file: Option<PathBuf>,
}

/// Result of `auth status`
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub environment: String,
    pub collection: IdentityCollection,
    pub state: String,
    #[serde(skip)]
    pub session_state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub messaging_method: MessagingMethod,
    pub messaging_configured: bool,
}

/// Per-invocation application state
#[derive(Debug)]
pub struct App {
    store: ConfigStore,
    stored: GlobalPreferences,
    overrides: PreferenceOverrides,
    resolver: CommandResolver,
    authenticator: SessionAuthenticator,
}

impl App {
    pub fn new(store: ConfigStore, stored: GlobalPreferences, overrides: PreferenceOverrides) -> Self {
        Self {
            store,
            stored,
            overrides,
            resolver: CommandResolver::new(),
            authenticator: SessionAuthenticator::new(),
        }
    }

    /// Load preferences from `store` and layer `overrides` on top
    pub fn load(store: ConfigStore, overrides: PreferenceOverrides) -> Result<Self> {
        let stored = store
            .load_preferences()
            .context("Failed to load preferences")?;
        Ok(Self::new(store, stored, overrides))
    }

    pub fn with_authenticator(mut self, authenticator: SessionAuthenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Effective preferences for this process
    pub fn preferences(&self) -> GlobalPreferences {
        self.overrides.apply(&self.stored)
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn resolver(&self) -> &CommandResolver {
        &self.resolver
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        &self.authenticator
    }

    // ---- environments ----

    pub fn create_environment(&mut self, request: NewEnvironment) -> Result<Environment> {
        let url = request.backend_url.trim();
        if url.is_empty() {
            bail!("PocketBase URL is required (--pb-url)");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("PocketBase URL must start with http:// or https://, got '{}'", url);
        }

        let servers: Vec<String> = request
            .servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            bail!("at least one NATS server is required (--nats-servers)");
        }

        let env = Environment::new(&request.name, url, servers)
            .with_auth_collection(request.auth_collection)
            .with_organization(request.organization_id)
            .with_messaging_method(request.messaging_method);

        self.store.create_environment(&env)?;
        info!(environment = %env.name, "environment created");
        Ok(env)
    }

    pub fn list_environments(&self) -> Result<Vec<EnvironmentSummary>> {
        let prefs = self.preferences();
        let mut rows = Vec::new();
        for name in self.store.list_environments()? {
            let env = self.store.load_environment(&name)?;
            rows.push(EnvironmentSummary {
                active: prefs.active() == Some(name.as_str()),
                url: env.backend.url.clone(),
                auth_collection: env.backend.auth_collection,
                organization_id: env.backend.organization_id.clone(),
                session: self
                    .authenticator
                    .session_state(&env.backend.session)
                    .label()
                    .to_string(),
                name,
            });
        }
        Ok(rows)
    }

    pub fn select_environment(&mut self, name: &str) -> Result<Environment> {
        let env = self.store.load_environment(name)?;
        self.store.set_active_environment(&mut self.stored, name)?;
        info!(environment = name, "environment selected");
        Ok(env)
    }

    /// A named environment, or the active one
    pub fn show_environment(&self, name: Option<&str>) -> Result<Environment> {
        match name {
            Some(name) => Ok(self.store.load_environment(name)?),
            None => self.active_environment(),
        }
    }

    /// Delete an environment; returns whether it was the active one, in
    /// which case the active pointer is cleared.
    pub fn delete_environment(&mut self, name: &str) -> Result<bool> {
        self.store.delete_environment(name)?;
        info!(environment = name, "environment deleted");

        let was_active = self.stored.active() == Some(name);
        if was_active {
            self.stored.active_context.clear();
            self.store
                .save_preferences(&self.stored)
                .context("Environment deleted but failed to clear the active selection")?;
        }
        Ok(was_active)
    }

    pub fn active_environment(&self) -> Result<Environment> {
        Ok(self.store.get_active_environment(&self.preferences())?)
    }

    /// The active environment, provided its session can be used now
    pub fn usable_environment(&self) -> Result<Environment> {
        let env = self.active_environment()?;
        self.authenticator
            .ensure_usable(&env.backend.session)
            .with_context(|| format!("Environment '{}' cannot call PocketBase", env.name))?;
        Ok(env)
    }

    /// Register the environment's collections and require the full name.
    /// Returns the collection as the environment spells it.
    pub fn check_collection(&mut self, env: &Environment, collection: &str) -> Result<String> {
        self.resolver.insert_category(COLLECTIONS, &[]);
        for available in &env.backend.available_collections {
            self.resolver.add_command(COLLECTIONS, available);
        }
        if self.resolver.contains(COLLECTIONS, collection)? {
            if let Some(name) = env.collection_name(collection) {
                return Ok(name.to_string());
            }
        }

        let similar = self.resolver.suggest(COLLECTIONS, collection)?;
        if similar.is_empty() {
            bail!(
                "collection '{}' is not available in environment '{}'. Available: {}",
                collection,
                env.name,
                env.backend.available_collections.join(", ")
            );
        }
        bail!(
            "collection '{}' is not available in environment '{}'. Collection names must be typed in full; did you mean: {}?",
            collection,
            env.name,
            similar.join(", ")
        )
    }

    // ---- organization ----

    /// Point the active environment at another organization
    pub fn set_organization(
        &mut self,
        identity: &dyn IdentityService,
        organization_id: &str,
    ) -> Result<OrganizationUpdate> {
        let organization_id = organization_id.trim();
        if organization_id.is_empty() {
            bail!("organization ID cannot be empty");
        }

        let mut env = self.active_environment()?;
        let session = &env.backend.session;
        if !session.is_authenticated() {
            return Err(SessionError::Unauthenticated)
                .context("Run 'flint auth pb' before setting an organization");
        }

        let validated = self.authenticator.is_session_valid(session);
        if validated {
            let record = session.record.clone().unwrap_or_default();
            match identity.validate_organization_access(&session.token, &record, organization_id) {
                OrganizationAccess::Granted => {
                    debug!(organization = organization_id, "organization access confirmed");
                }
                OrganizationAccess::NotMember => {
                    return Err(CollaboratorError::NotMember(organization_id.to_string()).into())
                }
                OrganizationAccess::Unreachable(reason) => {
                    return Err(CollaboratorError::Unreachable(reason))
                        .context("Organization validation failed")
                }
            }
            self.push_current_organization(identity, &env, organization_id);
        } else {
            warn!("session expired; organization will be set locally only");
        }

        env.backend.organization_id = Some(organization_id.to_string());
        self.store.save_environment(&env)?;

        Ok(OrganizationUpdate {
            environment: env.name,
            organization_id: organization_id.to_string(),
            validated,
        })
    }

    fn push_current_organization(&self, identity: &dyn IdentityService, env: &Environment, organization_id: &str) {
        let session = &env.backend.session;
        let Some(identity_id) = session.identity_id() else {
            return;
        };
        if let Err(e) = identity.update_current_organization(&session.token, identity_id, organization_id) {
            warn!("failed to update current organization in PocketBase: {}", e);
        }
    }

    // ---- authentication ----

    /// Password login for the active environment.
    ///
    /// `choose` is consulted only when the identity belongs to several
    /// organizations and nothing else decides; returning `None` leaves the
    /// organization unset.
    pub fn authenticate(
        &mut self,
        identity: &dyn IdentityService,
        request: LoginRequest,
        choose: &mut dyn FnMut(&OrganizationMembership) -> Result<Option<String>>,
    ) -> Result<LoginSummary> {
        let mut env = self.active_environment()?;
        let collection = request.collection.unwrap_or(env.backend.auth_collection);

        if request.identity.trim().is_empty() {
            bail!("identity (email or username) is required");
        }
        if request.secret.is_empty() {
            bail!("password is required");
        }

        info!(environment = %env.name, collection = %collection, "authenticating");
        let outcome = identity
            .authenticate(collection, request.identity.trim(), &request.secret)
            .context("Authentication failed")?;

        let session = self.authenticator.authenticated_session(&outcome);
        let mut selection = None;
        let organization = if collection.has_memberships() {
            let membership = self.membership_with_names(identity, &outcome.token, &outcome.record)?;
            let previously = current_organization_hint(Some(&outcome.record))
                .filter(|hint| membership.contains(hint))
                .or_else(|| env.backend.organization_id.clone());

            let chosen = self.authenticator.select_organization(
                &membership,
                request.organization.as_deref(),
                previously.as_deref(),
            )?;
            selection = Some(chosen.mode);

            match chosen.mode {
                SelectionMode::RequiresPrompt => {
                    let picked = choose(&chosen.candidates)?;
                    if let Some(id) = &picked {
                        if !membership.contains(id) {
                            bail!("invalid organization selection '{}'", id);
                        }
                    }
                    picked
                }
                SelectionMode::None => {
                    warn!("identity is not a member of any organization");
                    None
                }
                _ => chosen.organization_id,
            }
        } else {
            request.organization.filter(|o| !o.is_empty())
        };

        env.backend.auth_collection = collection;
        env.backend.session = session;
        if let Some(org) = &organization {
            env.backend.organization_id = Some(org.clone());
        }
        if collection.has_memberships() {
            if let Some(org) = &organization {
                self.push_current_organization(identity, &env, org);
            }
        }
        self.store.save_environment(&env)?;

        Ok(LoginSummary {
            environment: env.name.clone(),
            collection,
            identity_id: env.backend.session.identity_id().map(str::to_string),
            display_name: display_name(&outcome.record),
            organization_id: env.backend.organization_id.clone(),
            selection,
            expires: env.backend.session.expires,
        })
    }

    /// Membership from the login record, topped up from the backend when the
    /// record carries no names. A failed lookup leaves what the record had;
    /// a shape neither source can be read as is an error.
    fn membership_with_names(
        &self,
        identity: &dyn IdentityService,
        token: &str,
        record: &Map<String, Value>,
    ) -> Result<OrganizationMembership> {
        let mut membership = self
            .authenticator
            .membership_from_record(Some(record))
            .context("Could not read organizations from the auth record")?;
        if membership.has_names() {
            return Ok(membership);
        }

        let Some(identity_id) = record.get("id").and_then(Value::as_str) else {
            return Ok(membership);
        };
        let raw = match identity.fetch_organizations(token, identity_id) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("could not retrieve organizations: {}", e);
                return Ok(membership);
            }
        };
        let fetched = self
            .authenticator
            .normalize_membership(&raw)
            .context("Could not read organizations returned by PocketBase")?;
        if membership.is_empty() {
            membership = fetched;
        } else {
            membership.merge_names(&fetched);
        }
        Ok(membership)
    }

    /// Exchange the stored token for a fresh one
    pub fn refresh_session(&mut self, identity: &dyn IdentityService) -> Result<Environment> {
        let mut env = self.active_environment()?;
        if !env.backend.session.is_authenticated() {
            return Err(SessionError::Unauthenticated).context("Nothing to refresh");
        }

        let outcome = identity
            .refresh(env.backend.auth_collection, &env.backend.session.token)
            .context("Token refresh failed")?;
        env.backend.session = self.authenticator.authenticated_session(&outcome);
        self.store.save_environment(&env)?;
        info!(environment = %env.name, "session refreshed");
        Ok(env)
    }

    pub fn session_status(&self) -> Result<SessionStatus> {
        let env = self.active_environment()?;
        let state = self.authenticator.session_state(&env.backend.session);
        Ok(SessionStatus {
            environment: env.name.clone(),
            collection: env.backend.auth_collection,
            state: state.label().to_string(),
            session_state: state,
            identity_id: env.backend.session.identity_id().map(str::to_string),
            organization_id: env.backend.organization_id.clone(),
            messaging_method: env.messaging.auth.method(),
            messaging_configured: env.messaging.auth.is_configured(),
        })
    }

    // ---- messaging ----

    /// Replace the active environment's NATS credentials. Switching method
    /// discards the previous method's secrets.
    pub fn configure_messaging(&mut self, update: MessagingUpdate) -> Result<Environment> {
        let mut env = self.active_environment()?;
        let current = env.messaging.auth.clone();
        let method = update.method.unwrap_or_else(|| current.method());

        let auth = match method {
            MessagingMethod::UserPass => {
                let (old_user, old_pass) = match current {
                    MessagingAuth::UserPass { username, password } => (username, password),
                    _ => (None, None),
                };
                let username = update.username.or(old_user).filter(|u| !u.is_empty());
                let password = update.password.or(old_pass).filter(|p| !p.is_empty());
                if username.is_none() || password.is_none() {
                    bail!("username and password are required for user_pass authentication");
                }
                MessagingAuth::UserPass { username, password }
            }
            MessagingMethod::Token => {
                let old = match current {
                    MessagingAuth::Token { token } => token,
                    _ => None,
                };
                let token = update.token.or(old).filter(|t| !t.is_empty());
                if token.is_none() {
                    bail!("a token is required for token authentication");
                }
                MessagingAuth::Token { token }
            }
            MessagingMethod::Creds => {
                let old = match current {
                    MessagingAuth::Creds { creds_file } => creds_file,
                    _ => None,
                };
                let Some(path) = update.creds_file.or(old) else {
                    bail!("a credentials file is required for creds authentication");
                };
                let stored = self.store.relativize_auxiliary(&env.name, &path);
                if stored != path {
                    debug!(path = %stored.display(), "storing credentials path relative to environment");
                }
                MessagingAuth::Creds {
                    creds_file: Some(stored),
                }
            }
        };

        env.messaging.auth = auth;
        self.store.save_environment(&env)?;
        info!(environment = %env.name, method = %method, "NATS authentication configured");
        Ok(env)
    }

    /// Absolute credentials file path for the `creds` method
    pub fn credentials_path(&self, env: &Environment) -> Option<PathBuf> {
        match &env.messaging.auth {
            MessagingAuth::Creds {
                creds_file: Some(path),
            } => Some(self.store.resolve_auxiliary(&env.name, path)),
            _ => None,
        }
    }

    // ---- records ----

    pub fn list_records(
        &self,
        records: &dyn RecordService,
        collection: &str,
        options: &ListOptions,
    ) -> Result<RecordList> {
        options.validate()?;
        Ok(records.list(collection, options)?)
    }

    pub fn get_record(
        &self,
        records: &dyn RecordService,
        collection: &str,
        id: &str,
        expand: &[String],
    ) -> Result<Map<String, Value>> {
        Ok(records.get(collection, require_id(id)?, expand)?)
    }

    pub fn create_record(
        &self,
        records: &dyn RecordService,
        collection: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        validate_record_data(data)?;
        Ok(records.create(collection, data)?)
    }

    pub fn update_record(
        &self,
        records: &dyn RecordService,
        collection: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        validate_record_data(data)?;
        if data.is_empty() {
            bail!("no fields to update");
        }
        Ok(records.update(collection, require_id(id)?, data)?)
    }

    pub fn delete_record(&self, records: &dyn RecordService, collection: &str, id: &str) -> Result<()> {
        Ok(records.delete(collection, require_id(id)?)?)
    }
}

fn require_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        bail!("record ID is required");
    }
    Ok(id)
}

/// Human-readable name from an identity record
fn display_name(record: &Map<String, Value>) -> Option<String> {
    ["name", "username", "email", "code"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(Value::as_str))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Whether an error chain ends in "nothing selected" or "not found"
pub fn is_missing_environment(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<StoreError>())
        .any(StoreError::is_not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AuthOutcome;
    use crate::session::Clock;
    use chrono::TimeZone;
    use flint_core::Paths;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn app() -> (TempDir, App) {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(Paths::with_root(dir.path()));
        let app = App::load(store, PreferenceOverrides::default())
            .unwrap()
            .with_authenticator(SessionAuthenticator::with_clock(Clock::Fixed(now())));
        (dir, app)
    }

    fn request(name: &str) -> NewEnvironment {
        NewEnvironment {
            name: name.to_string(),
            backend_url: "https://api.example.io".into(),
            servers: vec!["nats://n1:4222".into()],
            auth_collection: IdentityCollection::Users,
            organization_id: None,
            messaging_method: MessagingMethod::Creds,
        }
    }

    struct FakeIdentity {
        record: Value,
        organizations: Value,
        updated: RefCell<Vec<String>>,
    }

    impl FakeIdentity {
        fn with_record(record: Value) -> Self {
            Self {
                record,
                organizations: Value::Null,
                updated: RefCell::new(Vec::new()),
            }
        }
    }

    impl IdentityService for FakeIdentity {
        fn authenticate(
            &self,
            _: IdentityCollection,
            identity: &str,
            secret: &str,
        ) -> Result<AuthOutcome, CollaboratorError> {
            if secret != "hunter2" {
                return Err(CollaboratorError::Status {
                    status: 400,
                    message: format!("Failed to authenticate {}.", identity),
                });
            }
            Ok(AuthOutcome {
                token: "fresh-token".into(),
                expires_hint: None,
                record: self.record.as_object().cloned().unwrap_or_default(),
            })
        }

        fn refresh(&self, _: IdentityCollection, token: &str) -> Result<AuthOutcome, CollaboratorError> {
            Ok(AuthOutcome {
                token: format!("{}-refreshed", token),
                expires_hint: Some(now() + chrono::Duration::hours(1)),
                record: self.record.as_object().cloned().unwrap_or_default(),
            })
        }

        fn fetch_organizations(&self, _: &str, _: &str) -> Result<Value, CollaboratorError> {
            Ok(self.organizations.clone())
        }

        fn update_current_organization(&self, _: &str, _: &str, org: &str) -> Result<(), CollaboratorError> {
            self.updated.borrow_mut().push(org.to_string());
            Ok(())
        }
    }

    fn login(password: &str) -> LoginRequest {
        LoginRequest {
            identity: "ops@example.io".into(),
            secret: password.into(),
            ..Default::default()
        }
    }

    fn never_prompt(_: &OrganizationMembership) -> Result<Option<String>> {
        panic!("prompt not expected")
    }

    #[test]
    fn test_deleting_active_environment_clears_pointer() {
        let (_dir, mut app) = app();
        app.create_environment(request("a")).unwrap();
        app.select_environment("a").unwrap();
        assert_eq!(app.preferences().active(), Some("a"));

        assert!(app.delete_environment("a").unwrap());
        assert_eq!(app.preferences().active(), None);
        assert_eq!(app.store().load_preferences().unwrap().active(), None);

        let err = app.active_environment().unwrap_err();
        assert!(err.to_string().contains("no active environment"));
        assert!(is_missing_environment(&err));
    }

    #[test]
    fn test_deleting_other_environment_keeps_pointer() {
        let (_dir, mut app) = app();
        app.create_environment(request("a")).unwrap();
        app.create_environment(request("b")).unwrap();
        app.select_environment("a").unwrap();

        assert!(!app.delete_environment("b").unwrap());
        assert_eq!(app.preferences().active(), Some("a"));
    }

    #[test]
    fn test_create_validates_input() {
        let (_dir, mut app) = app();
        let mut bad_url = request("x");
        bad_url.backend_url = "api.example.io".into();
        assert!(app.create_environment(bad_url).is_err());

        let mut no_servers = request("x");
        no_servers.servers = vec![" ".into()];
        assert!(app.create_environment(no_servers).is_err());

        let mut bad_name = request("bad name");
        bad_name.name = "bad name".into();
        assert!(app.create_environment(bad_name).is_err());

        app.create_environment(request("x")).unwrap();
        assert!(app.create_environment(request("x")).is_err());
    }

    #[test]
    fn test_list_marks_active() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.create_environment(request("dev")).unwrap();
        app.select_environment("prod").unwrap();

        let rows = app.list_environments().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "dev");
        assert!(!rows[0].active);
        assert!(rows[1].active);
        assert_eq!(rows[1].session, "unauthenticated");
    }

    #[test]
    fn test_override_selects_without_persisting() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(Paths::with_root(dir.path()));
        let overrides = PreferenceOverrides {
            active_context: Some("staging".into()),
            ..Default::default()
        };
        let mut app = App::load(store, overrides).unwrap();
        app.create_environment(request("staging")).unwrap();

        assert_eq!(app.active_environment().unwrap().name, "staging");
        assert_eq!(app.store().load_preferences().unwrap().active(), None);
    }

    #[test]
    fn test_login_with_sole_membership() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({
            "id": "u1",
            "email": "ops@example.io",
            "expand": {"organizations": [{"id": "o1", "name": "Acme"}]}
        }));
        let summary = app
            .authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap();

        assert_eq!(summary.organization_id.as_deref(), Some("o1"));
        assert_eq!(summary.selection, Some(SelectionMode::SoleMembership));
        assert_eq!(summary.display_name.as_deref(), Some("ops@example.io"));
        assert_eq!(*identity.updated.borrow(), vec!["o1".to_string()]);

        let env = app.active_environment().unwrap();
        assert_eq!(env.backend.session.token, "fresh-token");
        assert_eq!(env.backend.session.expires, Some(now() + chrono::Duration::days(7)));
        assert!(app.usable_environment().is_ok());
    }

    #[test]
    fn test_login_prompts_for_multiple_organizations() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let mut identity = FakeIdentity::with_record(json!({"id": "u1", "organizations": ["o1", "o2"]}));
        identity.organizations = json!([{"id": "o1", "name": "Acme"}, {"id": "o2", "name": "Globex"}]);

        let mut offered = Vec::new();
        let summary = app
            .authenticate(&identity, login("hunter2"), &mut |m: &OrganizationMembership| {
                offered = m.iter().map(|o| o.label()).collect();
                Ok::<_, anyhow::Error>(Some("o2".to_string()))
            })
            .unwrap();

        assert_eq!(offered, vec!["Acme (o1)", "Globex (o2)"]);
        assert_eq!(summary.organization_id.as_deref(), Some("o2"));
        assert_eq!(summary.selection, Some(SelectionMode::RequiresPrompt));
    }

    #[test]
    fn test_login_prefers_current_organization_hint() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({
            "id": "u1",
            "organizations": ["o1", "o2"],
            "current_organization_id": "o2"
        }));
        let summary = app
            .authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap();
        assert_eq!(summary.selection, Some(SelectionMode::PreviouslyStored));
        assert_eq!(summary.organization_id.as_deref(), Some("o2"));
    }

    #[test]
    fn test_login_explicit_organization_mismatch_keeps_old_session() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({"id": "u1", "organizations": ["o1"]}));
        let mut req = login("hunter2");
        req.organization = Some("o9".into());

        let err = app.authenticate(&identity, req, &mut never_prompt).unwrap_err();
        assert!(err
            .chain()
            .any(|e| matches!(e.downcast_ref::<SessionError>(), Some(SessionError::OrganizationMismatch { .. }))));
        assert!(!app.active_environment().unwrap().backend.session.is_authenticated());
    }

    #[test]
    fn test_login_bad_password_surfaces_collaborator_error() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({"id": "u1"}));
        let err = app
            .authenticate(&identity, login("wrong"), &mut never_prompt)
            .unwrap_err();
        let collab = err
            .chain()
            .find_map(|e| e.downcast_ref::<CollaboratorError>())
            .unwrap();
        assert!(collab.friendly_message().contains("Invalid email or password"));
    }

    fn is_shape_error(err: &anyhow::Error) -> bool {
        err.chain().any(|e| {
            matches!(
                e.downcast_ref::<SessionError>(),
                Some(SessionError::UnrecognizedMembershipShape(_))
            )
        })
    }

    #[test]
    fn test_login_rejects_unreadable_membership() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({"id": "u1", "organizations": 42}));
        let err = app
            .authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap_err();
        assert!(is_shape_error(&err));

        let mut req = login("hunter2");
        req.organization = Some("o1".into());
        let err = app.authenticate(&identity, req, &mut never_prompt).unwrap_err();
        assert!(is_shape_error(&err));
        assert!(!app.active_environment().unwrap().backend.session.is_authenticated());
    }

    #[test]
    fn test_login_rejects_unreadable_fetched_membership() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let mut identity = FakeIdentity::with_record(json!({"id": "u1"}));
        identity.organizations = json!(true);
        let err = app
            .authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap_err();
        assert!(is_shape_error(&err));
        assert!(identity.updated.borrow().is_empty());
    }

    #[test]
    fn test_non_user_collection_skips_membership() {
        let (_dir, mut app) = app();
        let mut req = request("edge");
        req.auth_collection = IdentityCollection::Edges;
        app.create_environment(req).unwrap();
        app.select_environment("edge").unwrap();

        let identity = FakeIdentity::with_record(json!({"id": "e1", "code": "edge-01"}));
        let summary = app
            .authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap();
        assert_eq!(summary.collection, IdentityCollection::Edges);
        assert_eq!(summary.selection, None);
        assert!(identity.updated.borrow().is_empty());
    }

    #[test]
    fn test_refresh_and_status() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let identity = FakeIdentity::with_record(json!({"id": "u1"}));
        assert!(app.refresh_session(&identity).is_err());

        app.authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap();
        let env = app.refresh_session(&identity).unwrap();
        assert_eq!(env.backend.session.token, "fresh-token-refreshed");

        let status = app.session_status().unwrap();
        assert_eq!(status.state, "valid");
        assert_eq!(status.identity_id.as_deref(), Some("u1"));
        assert!(!status.messaging_configured);
    }

    #[test]
    fn test_expired_session_is_not_usable() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let mut env = app.active_environment().unwrap();
        env.backend.session.token = "old".into();
        env.backend.session.expires = Some(now() + chrono::Duration::minutes(3));
        app.store().save_environment(&env).unwrap();

        let err = app.usable_environment().unwrap_err();
        assert!(err
            .chain()
            .any(|e| matches!(e.downcast_ref::<SessionError>(), Some(SessionError::Expired { .. }))));
    }

    #[test]
    fn test_set_organization() {
        let (_dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let mut identity = FakeIdentity::with_record(json!({"id": "u1", "organizations": ["o1"]}));
        assert!(app.set_organization(&identity, "o1").is_err());

        app.authenticate(&identity, login("hunter2"), &mut never_prompt)
            .unwrap();
        identity.organizations = json!(["o1", "o2"]);

        let update = app.set_organization(&identity, "o2").unwrap();
        assert!(update.validated);
        assert_eq!(
            app.active_environment().unwrap().backend.organization_id.as_deref(),
            Some("o2")
        );

        let err = app.set_organization(&identity, "o3").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollaboratorError>(),
            Some(CollaboratorError::NotMember(_))
        ));
    }

    #[test]
    fn test_configure_messaging_switches_methods() {
        let (dir, mut app) = app();
        app.create_environment(request("prod")).unwrap();
        app.select_environment("prod").unwrap();

        let env = app
            .configure_messaging(MessagingUpdate {
                method: Some(MessagingMethod::Token),
                token: Some("nats-token".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(env.messaging.auth.is_configured());

        assert!(app
            .configure_messaging(MessagingUpdate {
                method: Some(MessagingMethod::UserPass),
                username: Some("svc".into()),
                ..Default::default()
            })
            .is_err());

        let creds = dir.path().join("contexts/prod/user.creds");
        fs::write(&creds, "creds").unwrap();
        let env = app
            .configure_messaging(MessagingUpdate {
                method: Some(MessagingMethod::Creds),
                creds_file: Some(creds.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            env.messaging.auth,
            MessagingAuth::Creds {
                creds_file: Some(PathBuf::from("./user.creds"))
            }
        );
        assert_eq!(app.credentials_path(&env), Some(creds));
    }

    #[test]
    fn test_check_collection_is_exact() {
        let (_dir, mut app) = app();
        let env = app.create_environment(request("prod")).unwrap();

        assert_eq!(app.check_collection(&env, "edges").unwrap(), "edges");
        assert_eq!(app.check_collection(&env, "EDGES").unwrap(), "edges");
        let err = app.check_collection(&env, "edge").unwrap_err().to_string();
        assert!(err.contains("did you mean: edge_regions, edge_types, edges"));
        let err = app.check_collection(&env, "widgets").unwrap_err().to_string();
        assert!(err.contains("Available: organizations"));
    }

    struct FakeRecords {
        created: RefCell<Vec<Map<String, Value>>>,
    }

    impl RecordService for FakeRecords {
        fn list(&self, _: &str, options: &ListOptions) -> Result<RecordList, CollaboratorError> {
            Ok(RecordList {
                page: options.page,
                per_page: options.per_page,
                total_items: 0,
                total_pages: 0,
                items: Vec::new(),
            })
        }

        fn get(&self, _: &str, id: &str, _: &[String]) -> Result<Map<String, Value>, CollaboratorError> {
            Ok(json!({ "id": id }).as_object().cloned().unwrap_or_default())
        }

        fn create(&self, _: &str, data: &Map<String, Value>) -> Result<Map<String, Value>, CollaboratorError> {
            self.created.borrow_mut().push(data.clone());
            Ok(data.clone())
        }

        fn update(&self, _: &str, _: &str, data: &Map<String, Value>) -> Result<Map<String, Value>, CollaboratorError> {
            Ok(data.clone())
        }

        fn delete(&self, _: &str, _: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    #[test]
    fn test_record_operations_validate_before_calling() {
        let (_dir, app) = app();
        let records = FakeRecords {
            created: RefCell::new(Vec::new()),
        };

        let restricted = json!({"id": "x", "name": "edge"});
        assert!(app
            .create_record(&records, "edges", restricted.as_object().unwrap())
            .is_err());
        assert!(records.created.borrow().is_empty());

        let ok = json!({"name": "edge"});
        app.create_record(&records, "edges", ok.as_object().unwrap())
            .unwrap();
        assert_eq!(records.created.borrow().len(), 1);

        assert!(app.get_record(&records, "edges", " ", &[]).is_err());
        assert!(app
            .list_records(&records, "edges", &ListOptions::with_per_page(900))
            .is_err());
        assert!(app
            .update_record(&records, "edges", "e1", &Map::new())
            .is_err());
    }
}
