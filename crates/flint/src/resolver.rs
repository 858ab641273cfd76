//! Abbreviated command resolution
//!
//! Users may type any unambiguous prefix of a command (`env sel prod`,
//! `collections edges l`). Each group of mutually exclusive commands is a
//! category; resolution only ever compares an input against one category.

use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level verbs
pub const ROOT: &str = "root";
/// `environment <subcommand>`
pub const ENVIRONMENT: &str = "environment";
/// `auth <subcommand>`
pub const AUTH: &str = "auth";
/// `nats <subcommand>`
pub const NATS: &str = "nats";
/// `collections <collection> <action>`
pub const RECORD_ACTIONS: &str = "record-actions";
/// Collections of the active environment; matched exactly, never abbreviated
pub const COLLECTIONS: &str = "collections";

/// Resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown command '{input}'. Available commands: {}", available.join(", "))]
    Unknown { input: String, available: Vec<String> },

    #[error("ambiguous command '{input}'. Possible matches: {}", candidates.join(", "))]
    Ambiguous { input: String, candidates: Vec<String> },

    /// The caller asked for a category that was never registered
    #[error("unknown command category: {0}")]
    CategoryNotFound(String),
}

/// Maps category names to their canonical commands
#[derive(Debug, Clone, Default)]
pub struct CommandResolver {
    categories: BTreeMap<String, Vec<String>>,
}

impl CommandResolver {
    /// Resolver preloaded with every flint command category
    pub fn new() -> Self {
        let mut resolver = Self::empty();
        resolver.insert_category(ROOT, &["environment", "collections", "auth", "nats"]);
        resolver.insert_category(
            ENVIRONMENT,
            &["create", "list", "select", "show", "delete", "organization"],
        );
        resolver.insert_category(AUTH, &["pb", "nats", "refresh", "status"]);
        resolver.insert_category(NATS, &["publish", "subscribe"]);
        resolver.insert_category(RECORD_ACTIONS, &["list", "get", "create", "update", "delete"]);
        resolver
    }

    /// Resolver with no categories
    pub fn empty() -> Self {
        Self {
            categories: BTreeMap::new(),
        }
    }

    /// Register (or replace) a category
    pub fn insert_category(&mut self, category: &str, commands: &[&str]) {
        let mut list: Vec<String> = Vec::with_capacity(commands.len());
        for command in commands {
            if !list.iter().any(|c| c.eq_ignore_ascii_case(command)) {
                list.push(command.to_string());
            }
        }
        self.categories.insert(category.to_string(), list);
    }

    /// Add a single command to a category, creating the category if needed
    pub fn add_command(&mut self, category: &str, command: &str) {
        let list = self.categories.entry(category.to_string()).or_default();
        if !list.iter().any(|c| c.eq_ignore_ascii_case(command)) {
            list.push(command.to_string());
        }
    }

    /// Canonical commands of a category in registration order
    pub fn commands(&self, category: &str) -> Result<&[String], ResolveError> {
        self.categories
            .get(category)
            .map(|c| c.as_slice())
            .ok_or_else(|| ResolveError::CategoryNotFound(category.to_string()))
    }

    /// Resolve a typed prefix to exactly one canonical command.
    ///
    /// An exact (case-insensitive) match always wins over longer commands
    /// sharing the prefix.
    pub fn resolve(&self, category: &str, typed: &str) -> Result<String, ResolveError> {
        let commands = self.commands(category)?;
        let needle = typed.to_lowercase();

        if needle.is_empty() {
            return Err(ResolveError::Unknown {
                input: typed.to_string(),
                available: commands.to_vec(),
            });
        }

        if let Some(exact) = commands.iter().find(|c| c.to_lowercase() == needle) {
            return Ok(exact.clone());
        }

        let mut matches = prefix_matches(commands, &needle);
        match matches.len() {
            0 => Err(ResolveError::Unknown {
                input: typed.to_string(),
                available: commands.to_vec(),
            }),
            1 => Ok(matches.remove(0)),
            _ => {
                matches.sort();
                Err(ResolveError::Ambiguous {
                    input: typed.to_string(),
                    candidates: matches,
                })
            }
        }
    }

    /// Shortest prefix of `full` that resolves back to it
    pub fn minimum_prefix(&self, category: &str, full: &str) -> Result<String, ResolveError> {
        let commands = self.commands(category)?;
        let target = commands
            .iter()
            .find(|c| c.eq_ignore_ascii_case(full))
            .ok_or_else(|| ResolveError::Unknown {
                input: full.to_string(),
                available: commands.to_vec(),
            })?;

        let ends = target
            .char_indices()
            .map(|(i, c)| i + c.len_utf8());
        for end in ends {
            let prefix = &target[..end];
            if self.resolve(category, prefix).as_deref() == Ok(target.as_str()) {
                return Ok(prefix.to_string());
            }
        }

        Ok(target.clone())
    }

    /// Sorted prefix matches; an empty input lists the whole category
    pub fn suggest(&self, category: &str, typed: &str) -> Result<Vec<String>, ResolveError> {
        let commands = self.commands(category)?;
        let mut matches = prefix_matches(commands, &typed.to_lowercase());
        matches.sort();
        Ok(matches)
    }

    /// Exact membership, for values that must never be abbreviated
    pub fn contains(&self, category: &str, value: &str) -> Result<bool, ResolveError> {
        let commands = self.commands(category)?;
        Ok(commands.iter().any(|c| c.eq_ignore_ascii_case(value)))
    }
}

fn prefix_matches(commands: &[String], needle: &str) -> Vec<String> {
    commands
        .iter()
        .filter(|c| c.to_lowercase().starts_with(needle))
        .cloned()
        .collect()
}
