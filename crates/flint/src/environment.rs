//! Environment (context) records
//!
//! An environment bundles everything needed to talk to one Stone-Age.io
//! deployment: the PocketBase backend, the NATS servers, and the cached
//! authentication session. Each one is stored in its own directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::store::StoreError;

/// Longest accepted environment name
pub const MAX_NAME_LEN: usize = 50;

/// Collections every new environment can address
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "organizations",
    "users",
    "edges",
    "things",
    "locations",
    "clients",
    "edge_types",
    "thing_types",
    "location_types",
    "edge_regions",
    "audit_logs",
    "topic_permissions",
];

/// Validate an environment name: letters, digits, `-` and `_`, at most 50 chars
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name must be 50 characters or less"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "name can only contain letters, numbers, hyphens, and underscores",
        ));
    }
    Ok(())
}

/// Auth collection used to identify the caller against the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityCollection {
    /// Human administrators
    #[default]
    Users,
    /// NATS client entities
    Clients,
    /// Edge devices
    Edges,
    /// Leaf devices managed by an edge
    Things,
    /// System service accounts
    ServiceUsers,
}

impl IdentityCollection {
    pub const ALL: [IdentityCollection; 5] = [
        Self::Users,
        Self::Clients,
        Self::Edges,
        Self::Things,
        Self::ServiceUsers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Clients => "clients",
            Self::Edges => "edges",
            Self::Things => "things",
            Self::ServiceUsers => "service_users",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Users => "Users (Human Administrators)",
            Self::Clients => "Clients (NATS Client Entities)",
            Self::Edges => "Edges (Edge Device Authentication)",
            Self::Things => "Things (Individual Device Authentication)",
            Self::ServiceUsers => "Service Users (System Service Accounts)",
        }
    }

    /// Only human accounts carry organization membership
    pub fn has_memberships(&self) -> bool {
        matches!(self, Self::Users)
    }
}

impl fmt::Display for IdentityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityCollection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|c| c.as_str()).collect();
                format!(
                    "invalid auth collection '{}'. Valid options: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// Cached authentication result.
///
/// Replaced as a whole on every successful authentication.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token; empty means unauthenticated
    #[serde(default)]
    pub token: String,

    /// Token expiry; absent means the token is trusted as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,

    /// Identity record returned by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Map<String, Value>>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }

    /// `id` of the identity record, if any
    pub fn identity_id(&self) -> Option<&str> {
        self.record.as_ref()?.get("id")?.as_str()
    }
}

/// PocketBase connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,

    #[serde(default)]
    pub auth_collection: IdentityCollection,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    #[serde(default = "default_collections")]
    pub available_collections: Vec<String>,

    #[serde(default)]
    pub session: Session,
}

fn default_collections() -> Vec<String> {
    DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect()
}

/// NATS authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingMethod {
    UserPass,
    Token,
    #[default]
    Creds,
}

impl MessagingMethod {
    pub const ALL: [MessagingMethod; 3] = [Self::UserPass, Self::Token, Self::Creds];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPass => "user_pass",
            Self::Token => "token",
            Self::Creds => "creds",
        }
    }
}

impl fmt::Display for MessagingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "invalid NATS auth method '{}'. Valid options: user_pass, token, creds",
                    s
                )
            })
    }
}

/// NATS credentials. Only the active method's secret exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MessagingAuth {
    UserPass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Token {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Creds {
        /// Absolute, or `./`-relative to the environment directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        creds_file: Option<PathBuf>,
    },
}

impl Default for MessagingAuth {
    fn default() -> Self {
        Self::unconfigured(MessagingMethod::default())
    }
}

impl MessagingAuth {
    /// A method with no secret material yet
    pub fn unconfigured(method: MessagingMethod) -> Self {
        match method {
            MessagingMethod::UserPass => Self::UserPass {
                username: None,
                password: None,
            },
            MessagingMethod::Token => Self::Token { token: None },
            MessagingMethod::Creds => Self::Creds { creds_file: None },
        }
    }

    pub fn method(&self) -> MessagingMethod {
        match self {
            Self::UserPass { .. } => MessagingMethod::UserPass,
            Self::Token { .. } => MessagingMethod::Token,
            Self::Creds { .. } => MessagingMethod::Creds,
        }
    }

    /// Whether the secret material for the method is present
    pub fn is_configured(&self) -> bool {
        match self {
            Self::UserPass { username, password } => username.is_some() && password.is_some(),
            Self::Token { token } => token.is_some(),
            Self::Creds { creds_file } => creds_file.is_some(),
        }
    }
}

/// NATS connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub servers: Vec<String>,

    #[serde(default)]
    pub auth: MessagingAuth,

    #[serde(default = "default_true")]
    pub tls_enabled: bool,

    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

fn default_true() -> bool {
    true
}

/// A named environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Also the name of the storage directory; the two never diverge
    pub name: String,

    #[serde(rename = "pocketbase")]
    pub backend: BackendConfig,

    #[serde(rename = "nats")]
    pub messaging: MessagingConfig,
}

impl Environment {
    /// A new environment with default collections and secure TLS settings
    pub fn new(name: &str, url: &str, servers: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            backend: BackendConfig {
                url: url.trim_end_matches('/').to_string(),
                auth_collection: IdentityCollection::default(),
                organization_id: None,
                available_collections: default_collections(),
                session: Session::default(),
            },
            messaging: MessagingConfig {
                servers,
                auth: MessagingAuth::default(),
                tls_enabled: true,
                tls_verify: true,
            },
        }
    }

    pub fn with_auth_collection(mut self, collection: IdentityCollection) -> Self {
        self.backend.auth_collection = collection;
        self
    }

    pub fn with_organization(mut self, organization_id: Option<String>) -> Self {
        self.backend.organization_id = organization_id.filter(|o| !o.is_empty());
        self
    }

    pub fn with_messaging_method(mut self, method: MessagingMethod) -> Self {
        self.messaging.auth = MessagingAuth::unconfigured(method);
        self
    }

    /// Stored spelling of a collection. Names must be typed in full; case
    /// is ignored.
    pub fn collection_name(&self, collection: &str) -> Option<&str> {
        self.backend
            .available_collections
            .iter()
            .find(|c| c.eq_ignore_ascii_case(collection))
            .map(String::as_str)
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.collection_name(collection).is_some()
    }
}
