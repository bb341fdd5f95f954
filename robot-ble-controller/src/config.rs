//! Session configuration
//!
//! Loaded from `$ROBOT_HOME/config.json` (default `~/.robot/config.json`).
//! Every field is optional; a missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use robot_proto::RoleSet;
use serde::{Deserialize, Serialize};

/// Scan window used when nothing else is configured
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 20;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scan stops by itself after this many seconds
    pub scan_timeout_secs: u64,
    /// Only surface peers whose name starts with this
    pub name_prefix: Option<String>,
    /// Characteristic roles the robot must expose
    pub protocol: RoleSet,
    /// Buffer of the session event broadcast
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            name_prefix: None,
            protocol: RoleSet::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Read config from `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_timeout_secs == 0 {
            return Err(ConfigError::Invalid("scan_timeout_secs must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive"));
        }
        if self.name_prefix.as_deref() == Some("") {
            return Err(ConfigError::Invalid("name_prefix must not be empty"));
        }
        Ok(())
    }
}

/// `$ROBOT_HOME`, or `~/.robot`
pub fn robot_home() -> Option<PathBuf> {
    match std::env::var_os("ROBOT_HOME") {
        Some(home) => Some(PathBuf::from(home)),
        None => dirs::home_dir().map(|home| home.join(".robot")),
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    robot_home().map(|home| home.join("config.json"))
}
