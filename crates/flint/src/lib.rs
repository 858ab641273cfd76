//! flint - context-aware CLI for the Stone-Age.io IoT platform
//!
//! Manages named environments, each pairing a PocketBase backend with NATS
//! servers and cached credentials, and routes abbreviated commands to the
//! backend or the message bus of the selected one.

pub mod app;
pub mod environment;
pub mod identity;
pub mod membership;
pub mod messaging;
pub mod preferences;
pub mod records;
pub mod resolver;
pub mod session;
pub mod store;

pub use app::App;
pub use environment::Environment;
pub use preferences::{GlobalPreferences, OutputFormat, PreferenceOverrides};
pub use resolver::{CommandResolver, ResolveError};
pub use session::{SessionAuthenticator, SessionError};
pub use store::{ConfigStore, StoreError};
