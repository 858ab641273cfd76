//! Standard paths used by flint

use std::path::{Path, PathBuf};

/// Environment variable that relocates the whole configuration root
pub const CONFIG_DIR_ENV: &str = "FLINT_CONFIG_DIR";

/// Name of the global preferences document
pub const PREFERENCES_FILE: &str = "config.yaml";

/// Name of the per-context configuration document
pub const CONTEXT_FILE: &str = "context.yaml";

/// Standard flint paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Config directory (~/.config/flint)
    pub config: PathBuf,
    /// One subdirectory per context (~/.config/flint/contexts)
    pub contexts: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        if let Some(root) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::with_root(PathBuf::from(root));
        }

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("flint");

        Self::with_root(config)
    }

    /// Paths rooted at an explicit directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let config = root.into();
        let contexts = config.join("contexts");
        Self { config, contexts }
    }

    /// Global preferences file
    pub fn preferences(&self) -> PathBuf {
        self.config.join(PREFERENCES_FILE)
    }

    /// Storage directory for a context
    pub fn context_dir(&self, name: &str) -> PathBuf {
        self.contexts.join(name)
    }

    /// Configuration document inside a context directory
    pub fn context_file(&self, name: &str) -> PathBuf {
        self.context_dir(name).join(CONTEXT_FILE)
    }

    /// Resolve a path stored in a context document.
    ///
    /// Paths written as `./file` (or any other relative form) are anchored at
    /// the context directory so auxiliary files travel with the context.
    pub fn context_relative(&self, name: &str, stored: &Path) -> PathBuf {
        if stored.is_absolute() {
            stored.to_path_buf()
        } else {
            let trimmed = stored.strip_prefix(".").unwrap_or(stored);
            self.context_dir(name).join(trimmed)
        }
    }
}
