//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/eventpipe/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/eventpipe/` (~/.config/eventpipe/)
//! - Data: `$XDG_DATA_HOME/eventpipe/` (~/.local/share/eventpipe/)
//! - State/Logs: `$XDG_STATE_HOME/eventpipe/` (~/.local/state/eventpipe/)
//!
//! ```toml
//! [queue]
//! max_batch_size = 100
//! upload_interval_secs = 30
//! upload_threshold = 30
//! max_events = 1000
//!
//! [session]
//! max_session_age_ms = 300000
//!
//! [[destinations]]
//! name = "primary"
//! url = "https://telemetry.example.com/v1/batch"
//! api_key = "pk_live_xxxx"
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{Error, Result};
use crate::types::QueueConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default inactivity timeout before a new session starts (5 minutes).
pub const DEFAULT_MAX_SESSION_AGE_MS: u64 = 300_000;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Batching limits shared by every destination queue
    #[serde(default)]
    pub queue: QueueSettings,

    /// Session tracking
    #[serde(default)]
    pub session: SessionConfig,

    /// Upload destinations; each gets its own queue
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue batching configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Upper bound on events per upload
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Seconds before a partial batch is flushed
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,

    /// Buffered events that trigger an immediate flush
    #[serde(default = "default_upload_threshold")]
    pub upload_threshold: usize,

    /// Buffer capacity per destination
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            upload_interval_secs: default_upload_interval_secs(),
            upload_threshold: default_upload_threshold(),
            max_events: default_max_events(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_batch_size: self.max_batch_size,
            upload_interval: Duration::from_secs(self.upload_interval_secs),
            upload_threshold: self.upload_threshold,
            max_events: self.max_events,
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config(
                "queue.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.upload_interval_secs == 0 {
            return Err(Error::Config(
                "queue.upload_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.upload_threshold == 0 {
            return Err(Error::Config(
                "queue.upload_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_events < self.upload_threshold {
            return Err(Error::Config(format!(
                "queue.max_events ({}) must be >= queue.upload_threshold ({})",
                self.max_events, self.upload_threshold
            )));
        }
        Ok(())
    }
}

fn default_max_batch_size() -> usize {
    100
}

fn default_upload_interval_secs() -> u64 {
    30
}

fn default_upload_threshold() -> usize {
    30
}

fn default_max_events() -> usize {
    1000
}

/// Session configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Milliseconds of inactivity after which the next start begins a new session
    #[serde(default = "default_max_session_age_ms")]
    pub max_session_age_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_age_ms: default_max_session_age_ms(),
        }
    }
}

impl SessionConfig {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_millis(self.max_session_age_ms)
    }
}

fn default_max_session_age_ms() -> u64 {
    DEFAULT_MAX_SESSION_AGE_MS
}

/// A single upload destination
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    /// Identifier used in logs and status output
    pub name: String,

    /// Endpoint batches are POSTed to
    pub url: String,

    /// Sent as `X-API-Key`
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Batches allowed in flight at once
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Max retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl DestinationConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("destinations.name is required".to_string()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "destination {}: url must start with http:// or https://",
                self.name
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(format!(
                "destination {}: timeout_secs must be at least 1",
                self.name
            )));
        }
        if self.max_concurrent_sends == 0 {
            return Err(Error::Config(format!(
                "destination {}: max_concurrent_sends must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_sends() -> usize {
    1
}

fn default_max_retries() -> usize {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Check every section, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;

        if self.session.max_session_age_ms == 0 {
            return Err(Error::Config(
                "session.max_session_age_ms must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for destination in &self.destinations {
            destination.validate()?;
            if !names.insert(destination.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate destination name: {}",
                    destination.name
                )));
            }
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to render config: {}", e)))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/eventpipe/config.toml` (~/.config/eventpipe/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("eventpipe").join("config.toml")
    }

    /// Returns the data directory path (for the session database)
    ///
    /// `$XDG_DATA_HOME/eventpipe/` (~/.local/share/eventpipe/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("eventpipe")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/eventpipe/` (~/.local/state/eventpipe/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("eventpipe")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/eventpipe/state.db` (~/.local/share/eventpipe/state.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/eventpipe/eventpipe.log` (~/.local/state/eventpipe/eventpipe.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("eventpipe.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.max_batch_size, 100);
        assert_eq!(config.queue.upload_interval_secs, 30);
        assert_eq!(config.queue.upload_threshold, 30);
        assert_eq!(config.queue.max_events, 1000);
        assert_eq!(config.session.max_session_age_ms, 300_000);
        assert!(config.destinations.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[queue]
max_batch_size = 2
upload_threshold = 3
max_events = 10
upload_interval_secs = 60

[session]
max_session_age_ms = 1000

[[destinations]]
name = "primary"
url = "https://telemetry.example.com/v1/batch"
api_key = "pk_test"
max_concurrent_sends = 2

[[destinations]]
name = "mirror"
url = "http://localhost:8080/batch"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.queue.to_queue_config(),
            QueueConfig {
                max_batch_size: 2,
                upload_interval: Duration::from_secs(60),
                upload_threshold: 3,
                max_events: 10,
            }
        );
        assert_eq!(config.session.max_session_age(), Duration::from_secs(1));
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0].api_key.as_deref(), Some("pk_test"));
        assert_eq!(config.destinations[0].max_concurrent_sends, 2);
        assert_eq!(config.destinations[1].api_key, None);
        assert_eq!(config.destinations[1].timeout_secs, 30);
        assert_eq!(config.destinations[1].max_retries, 3);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_validation() {
        let mut queue = QueueSettings::default();
        assert!(queue.validate().is_ok());

        queue.max_events = queue.upload_threshold - 1;
        assert!(queue.validate().is_err());

        let queue = QueueSettings {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(queue.validate().is_err());

        let queue = QueueSettings {
            upload_interval_secs: 0,
            ..Default::default()
        };
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_destination_validation() {
        let destination = DestinationConfig {
            name: "primary".to_string(),
            url: "ftp://example.com".to_string(),
            api_key: None,
            timeout_secs: 30,
            max_concurrent_sends: 1,
            max_retries: 3,
        };
        assert!(destination.validate().is_err());

        let destination = DestinationConfig {
            url: "https://example.com".to_string(),
            ..destination
        };
        assert!(destination.validate().is_ok());

        let mut config = Config {
            destinations: vec![destination.clone(), destination],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.destinations.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_age_must_be_positive() {
        let config = Config {
            session: SessionConfig {
                max_session_age_ms: 0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.queue, config.queue);
        assert_eq!(parsed.session, config.session);
    }

    #[test]
    fn test_paths_are_namespaced() {
        assert!(Config::config_path().ends_with("eventpipe/config.toml"));
        assert!(Config::database_path().ends_with("eventpipe/state.db"));
        assert!(Config::log_path().ends_with("eventpipe/eventpipe.log"));
    }
}
