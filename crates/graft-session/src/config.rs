//! Session-factory settings.
//!
//! Settings load from JSON or from a flat property map:
//!
//! ```text
//! graft.merge.entity_copy_observer = disallow | allow | log
//! graft.generate_statistics        = true | false
//! graft.flush_before_commit        = true | false
//! ```

use graft_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ENTITY_COPY_OBSERVER: &str = "graft.merge.entity_copy_observer";
pub const GENERATE_STATISTICS: &str = "graft.generate_statistics";
pub const FLUSH_BEFORE_COMMIT: &str = "graft.flush_before_commit";

/// What a merge does when two source instances map to one managed instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCopyPolicy {
    /// Fail the merge.
    #[default]
    Disallow,
    /// Accept silently.
    Allow,
    /// Accept and log a summary when the merge completes.
    Log,
}

impl EntityCopyPolicy {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "disallow" => Ok(EntityCopyPolicy::Disallow),
            "allow" => Ok(EntityCopyPolicy::Allow),
            "log" => Ok(EntityCopyPolicy::Log),
            other => Err(config_error(format!(
                "unknown entity copy observer '{other}' for {ENTITY_COPY_OBSERVER}"
            ))),
        }
    }
}

impl fmt::Display for EntityCopyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityCopyPolicy::Disallow => "disallow",
            EntityCopyPolicy::Allow => "allow",
            EntityCopyPolicy::Log => "log",
        })
    }
}

/// Immutable configuration of a session factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub entity_copy_observer: EntityCopyPolicy,
    pub generate_statistics: bool,
    /// Flush pending changes before `commit()`.
    pub flush_before_commit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            entity_copy_observer: EntityCopyPolicy::Disallow,
            generate_statistics: false,
            flush_before_commit: true,
        }
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(config_error(format!("invalid boolean '{other}' for {key}"))),
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid settings: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Read settings from `graft.*` properties; other keys are ignored.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Settings::default();
        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                ENTITY_COPY_OBSERVER => {
                    settings.entity_copy_observer = EntityCopyPolicy::parse(value)?;
                }
                GENERATE_STATISTICS => settings.generate_statistics = parse_bool(key, value)?,
                FLUSH_BEFORE_COMMIT => settings.flush_before_commit = parse_bool(key, value)?,
                other if other.starts_with("graft.") => {
                    tracing::warn!(key = other, "Ignoring unknown graft setting");
                }
                _ => {}
            }
        }
        Ok(settings)
    }
}
