//! Configuration store
//!
//! Layout under the configuration root:
//!
//! ```text
//! config.yaml                  global preferences
//! contexts/<name>/context.yaml one environment
//! contexts/<name>/*            auxiliary files owned by that environment
//! ```
//!
//! The store handles one entity at a time. Cross-entity rules, such as
//! clearing the active pointer when its environment is deleted, belong to the
//! caller.

use flint_core::Paths;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::environment::{validate_name, Environment};
use crate::preferences::GlobalPreferences;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("environment '{0}' not found")]
    NotFound(String),

    #[error("environment '{0}' already exists")]
    AlreadyExists(String),

    #[error("no active environment selected")]
    NoActiveEnvironment,

    #[error("invalid environment name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, message: impl ToString) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    /// Expected control flow rather than a broken store
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoActiveEnvironment)
    }
}

/// Directory-isolated storage for preferences and environments
#[derive(Debug, Clone)]
pub struct ConfigStore {
    paths: Paths,
}

impl ConfigStore {
    /// Store at the standard location
    pub fn open_default() -> Self {
        Self::new(Paths::new())
    }

    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Load preferences, writing defaults on first run
    pub fn load_preferences(&self) -> Result<GlobalPreferences, StoreError> {
        let path = self.paths.preferences();
        match fs::read_to_string(&path) {
            Ok(content) => {
                if content.trim().is_empty() {
                    return Ok(GlobalPreferences::default());
                }
                serde_yaml::from_str(&content).map_err(|e| StoreError::parse(&path, e))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let defaults = GlobalPreferences::default();
                self.save_preferences(&defaults)?;
                Ok(defaults)
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Overwrite the preferences document
    pub fn save_preferences(&self, prefs: &GlobalPreferences) -> Result<(), StoreError> {
        let path = self.paths.preferences();
        let content = serde_yaml::to_string(prefs).map_err(|e| StoreError::parse(&path, e))?;
        write_document(&path, &content)
    }

    /// Load one environment by name
    pub fn load_environment(&self, name: &str) -> Result<Environment, StoreError> {
        validate_name(name)?;
        let path = self.paths.context_file(name);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let env: Environment =
            serde_yaml::from_str(&content).map_err(|e| StoreError::parse(&path, e))?;

        if env.name != name {
            return Err(StoreError::parse(
                &path,
                format!("stored name '{}' does not match directory '{}'", env.name, name),
            ));
        }

        Ok(env)
    }

    /// Create the environment directory if needed and overwrite its document
    pub fn save_environment(&self, env: &Environment) -> Result<(), StoreError> {
        validate_name(&env.name)?;
        let path = self.paths.context_file(&env.name);
        let content = serde_yaml::to_string(env).map_err(|e| StoreError::parse(&path, e))?;
        write_document(&path, &content)
    }

    /// Save a new environment, refusing to overwrite an existing one
    pub fn create_environment(&self, env: &Environment) -> Result<(), StoreError> {
        if self.exists(&env.name) {
            return Err(StoreError::AlreadyExists(env.name.clone()));
        }
        self.save_environment(env)
    }

    /// Whether a loadable environment document exists
    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.paths.context_file(name).is_file()
    }

    /// Names of every directory holding a valid environment, sorted
    pub fn list_environments(&self) -> Result<Vec<String>, StoreError> {
        let dir = &self.paths.contexts;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.load_environment(&name).is_ok() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Remove an environment and everything in its directory
    pub fn delete_environment(&self, name: &str) -> Result<(), StoreError> {
        if !self.exists(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let dir = self.paths.context_dir(name);
        fs::remove_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))
    }

    /// The environment the preferences point at
    pub fn get_active_environment(
        &self,
        prefs: &GlobalPreferences,
    ) -> Result<Environment, StoreError> {
        let name = prefs.active().ok_or(StoreError::NoActiveEnvironment)?;
        self.load_environment(name)
    }

    /// Point the preferences at an existing environment and persist them
    pub fn set_active_environment(
        &self,
        prefs: &mut GlobalPreferences,
        name: &str,
    ) -> Result<(), StoreError> {
        if !self.exists(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        prefs.active_context = name.to_string();
        self.save_preferences(prefs)
    }

    /// Directory owned by an environment
    pub fn environment_dir(&self, name: &str) -> PathBuf {
        self.paths.context_dir(name)
    }

    /// Resolve an auxiliary file path stored in an environment document
    pub fn resolve_auxiliary(&self, name: &str, stored: &Path) -> PathBuf {
        self.paths.context_relative(name, stored)
    }

    /// Express `path` relative to the environment directory when it lives inside it
    pub fn relativize_auxiliary(&self, name: &str, path: &Path) -> PathBuf {
        let dir = self.environment_dir(name);
        match path.strip_prefix(&dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => Path::new(".").join(rel),
            _ => path.to_path_buf(),
        }
    }
}

fn write_document(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{MessagingAuth, Session};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::new(Paths::with_root(dir))
    }

    fn sample(name: &str) -> Environment {
        Environment::new(name, "https://api.example.io", vec!["nats://n1:4222".into()])
    }

    #[test]
    fn test_preferences_materialize_defaults() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let prefs = store.load_preferences().unwrap();
        assert_eq!(prefs, GlobalPreferences::default());
        assert!(dir.path().join("config.yaml").is_file());
    }

    #[test]
    fn test_preferences_parse_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), "output_format: [nope").unwrap();
        let err = store_in(dir.path()).load_preferences().unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn test_environment_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let mut env = sample("prod").with_organization(Some("org123".into()));
        env.backend.session = Session {
            token: "tok".into(),
            expires: Some(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()),
            record: json!({"id": "u1", "organizations": ["org123"]})
                .as_object()
                .cloned(),
        };
        env.messaging.auth = MessagingAuth::UserPass {
            username: Some("client".into()),
            password: Some("secret".into()),
        };

        store.save_environment(&env).unwrap();
        assert_eq!(store.load_environment("prod").unwrap(), env);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(matches!(
            store.load_environment("ghost"),
            Err(StoreError::NotFound(_))
        ));

        fs::create_dir_all(dir.path().join("contexts/empty")).unwrap();
        assert!(matches!(
            store.load_environment("empty"),
            Err(StoreError::NotFound(_))
        ));

        fs::create_dir_all(dir.path().join("contexts/bad")).unwrap();
        fs::write(dir.path().join("contexts/bad/context.yaml"), "name: [").unwrap();
        assert!(matches!(
            store.load_environment("bad"),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_name_must_match_directory() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.save_environment(&sample("alpha")).unwrap();
        fs::rename(dir.path().join("contexts/alpha"), dir.path().join("contexts/beta")).unwrap();
        assert!(matches!(
            store.load_environment("beta"),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.create_environment(&sample("dev")).unwrap();
        assert!(matches!(
            store.create_environment(&sample("dev")),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_list_skips_non_environment_directories() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.list_environments().unwrap().is_empty());

        store.save_environment(&sample("zeta")).unwrap();
        store.save_environment(&sample("alpha")).unwrap();
        fs::create_dir_all(dir.path().join("contexts/scratch")).unwrap();
        fs::write(dir.path().join("contexts/stray.yaml"), "x: 1").unwrap();

        assert_eq!(store.list_environments().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_delete_removes_auxiliary_files() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.save_environment(&sample("edge")).unwrap();
        let creds = store.environment_dir("edge").join("nats.creds");
        fs::write(&creds, "-----BEGIN NATS USER JWT-----").unwrap();

        store.delete_environment("edge").unwrap();
        assert!(!store.environment_dir("edge").exists());
        assert!(matches!(
            store.delete_environment("edge"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_active_environment_pointer() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut prefs = store.load_preferences().unwrap();

        assert!(matches!(
            store.get_active_environment(&prefs),
            Err(StoreError::NoActiveEnvironment)
        ));
        assert!(matches!(
            store.set_active_environment(&mut prefs, "missing"),
            Err(StoreError::NotFound(_))
        ));

        store.save_environment(&sample("prod")).unwrap();
        store.set_active_environment(&mut prefs, "prod").unwrap();
        assert_eq!(store.load_preferences().unwrap().active(), Some("prod"));
        assert_eq!(store.get_active_environment(&prefs).unwrap().name, "prod");

        // Deleting does not cascade; the dangling pointer surfaces as NotFound
        store.delete_environment("prod").unwrap();
        assert!(matches!(
            store.get_active_environment(&prefs),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_auxiliary_paths() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let inside = store.environment_dir("dev").join("keys/client.creds");

        let rel = store.relativize_auxiliary("dev", &inside);
        assert_eq!(rel, PathBuf::from("./keys/client.creds"));
        assert_eq!(store.resolve_auxiliary("dev", &rel), inside);

        let outside = PathBuf::from("/etc/nats/client.creds");
        assert_eq!(store.relativize_auxiliary("dev", &outside), outside);
    }
}
