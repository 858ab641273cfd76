//! Global preferences
//!
//! A single document holding the active environment pointer and display
//! settings. `FLINT_*` environment variables and command-line flags override
//! individual values for one process without being written back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// Output rendering for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
    Table,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Table => "table",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            "table" => Ok(Self::Table),
            other => Err(format!(
                "invalid output format '{}'. Valid options: json, yaml, table",
                other
            )),
        }
    }
}

/// Process-wide preferences document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPreferences {
    /// Selected environment; empty means none
    #[serde(default)]
    pub active_context: String,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default = "default_true")]
    pub colors_enabled: bool,

    #[serde(default = "default_pagination_size")]
    pub pagination_size: u32,

    /// Show organization lines in table output
    #[serde(default = "default_true")]
    pub organization_display: bool,

    #[serde(default)]
    pub debug: bool,
}

fn default_true() -> bool {
    true
}

fn default_pagination_size() -> u32 {
    30
}

impl Default for GlobalPreferences {
    fn default() -> Self {
        Self {
            active_context: String::new(),
            output_format: OutputFormat::Json,
            colors_enabled: true,
            pagination_size: default_pagination_size(),
            organization_display: true,
            debug: false,
        }
    }
}

impl GlobalPreferences {
    /// Active environment name, if one is selected
    pub fn active(&self) -> Option<&str> {
        if self.active_context.is_empty() {
            None
        } else {
            Some(&self.active_context)
        }
    }
}

/// Per-process overrides layered over the stored preferences
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferenceOverrides {
    pub active_context: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub colors_enabled: Option<bool>,
    pub pagination_size: Option<u32>,
    pub debug: Option<bool>,
}

impl PreferenceOverrides {
    /// Prefix shared by every preference variable
    pub const ENV_PREFIX: &'static str = "FLINT_";

    /// Read overrides from the process environment
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup (`FLINT_OUTPUT_FORMAT`, ...)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", Self::ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        let output_format = var("OUTPUT_FORMAT")
            .map(|v| v.parse::<OutputFormat>())
            .transpose()?;
        let colors_enabled = var("COLORS_ENABLED")
            .map(|v| parse_bool("FLINT_COLORS_ENABLED", &v))
            .transpose()?;
        let pagination_size = var("PAGINATION_SIZE")
            .map(|v| {
                v.trim()
                    .parse::<NonZeroU32>()
                    .map(NonZeroU32::get)
                    .map_err(|_| format!("FLINT_PAGINATION_SIZE must be a positive integer, got '{}'", v))
            })
            .transpose()?;
        let debug = var("DEBUG")
            .map(|v| parse_bool("FLINT_DEBUG", &v))
            .transpose()?;

        Ok(Self {
            active_context: var("ACTIVE_CONTEXT"),
            output_format,
            colors_enabled,
            pagination_size,
            debug,
        })
    }

    /// Later values win
    pub fn merge(mut self, other: PreferenceOverrides) -> Self {
        if other.active_context.is_some() {
            self.active_context = other.active_context;
        }
        if other.output_format.is_some() {
            self.output_format = other.output_format;
        }
        if other.colors_enabled.is_some() {
            self.colors_enabled = other.colors_enabled;
        }
        if other.pagination_size.is_some() {
            self.pagination_size = other.pagination_size;
        }
        if other.debug.is_some() {
            self.debug = other.debug;
        }
        self
    }

    /// Effective preferences for this process
    pub fn apply(&self, stored: &GlobalPreferences) -> GlobalPreferences {
        let mut effective = stored.clone();
        if let Some(active) = &self.active_context {
            effective.active_context = active.clone();
        }
        if let Some(format) = self.output_format {
            effective.output_format = format;
        }
        if let Some(colors) = self.colors_enabled {
            effective.colors_enabled = colors;
        }
        if let Some(size) = self.pagination_size {
            effective.pagination_size = size;
        }
        if let Some(debug) = self.debug {
            effective.debug = debug;
        }
        effective
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("{} must be true or false, got '{}'", name, value)),
    }
}
