//! FleetNode Configuration
//!
//! This module provides configuration structures for the cluster
//! membership and leader-election node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main FleetNode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetNodeConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination ensemble connection configuration
    pub ensemble: EnsembleConfig,

    /// Coordination tree layout
    #[serde(default)]
    pub paths: PathConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Self-registration configuration
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Leadership/membership state log
    #[serde(default)]
    pub state_log: StateLogConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host part of the node identity (detected from local interfaces if unset)
    #[serde(default)]
    pub host: Option<String>,

    /// Delay between connection-listener attachment attempts in milliseconds
    #[serde(default = "default_listener_retry_ms")]
    pub listener_retry_ms: u64,
}

/// Coordination ensemble connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Ensemble address (host:port)
    pub address: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Fixed interval between retries of transient ensemble errors
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

/// Coordination tree layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Root path of this fleet
    #[serde(default = "default_root_path")]
    pub root: String,

    /// Membership subtree, relative to root
    #[serde(default = "default_membership_path")]
    pub membership: String,

    /// Election subtree, relative to root (may equal membership)
    #[serde(default = "default_election_path")]
    pub election: String,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Re-enter the election queue after relinquishing leadership
    #[serde(default = "default_true")]
    pub auto_requeue: bool,

    /// Delay before re-contending after a failed contention round
    #[serde(default = "default_contend_retry_ms")]
    pub contend_retry_ms: u64,
}

/// Self-registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Attempts per registration round before giving up until the next reconnect
    #[serde(default = "default_registration_attempts")]
    pub attempts: u32,

    /// Backoff between registration attempts in milliseconds
    #[serde(default = "default_registration_backoff_ms")]
    pub backoff_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// State log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLogConfig {
    /// Persist leadership and membership events to SQLite
    #[serde(default)]
    pub enabled: bool,

    /// Database file path
    #[serde(default = "default_state_log_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_listener_retry_ms() -> u64 {
    1000
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_root_path() -> String {
    "/fleet".to_string()
}

fn default_membership_path() -> String {
    "members".to_string()
}

fn default_election_path() -> String {
    "leader".to_string()
}

fn default_contend_retry_ms() -> u64 {
    1000
}

fn default_registration_attempts() -> u32 {
    3
}

fn default_registration_backoff_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_state_log_path() -> PathBuf {
    PathBuf::from("/var/lib/fleetnode/state.db")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: None,
            listener_retry_ms: default_listener_retry_ms(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            root: default_root_path(),
            membership: default_membership_path(),
            election: default_election_path(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            auto_requeue: true,
            contend_retry_ms: default_contend_retry_ms(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            attempts: default_registration_attempts(),
            backoff_ms: default_registration_backoff_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StateLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_state_log_path(),
        }
    }
}

impl EnsembleConfig {
    /// Configuration pointing at the given address with default timings
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl FleetNodeConfig {
    /// Configuration with defaults for everything but the ensemble address
    pub fn with_ensemble(address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig::default(),
            ensemble: EnsembleConfig::with_address(address),
            paths: PathConfig::default(),
            election: ElectionConfig::default(),
            registration: RegistrationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            state_log: StateLogConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FleetNodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.ensemble.address.is_empty() {
            return Err(crate::Error::Config("ensemble.address cannot be empty".into()));
        }

        if !self.paths.root.starts_with('/') {
            return Err(crate::Error::Config(format!(
                "paths.root must be absolute, got '{}'",
                self.paths.root
            )));
        }

        for (name, value) in [
            ("paths.membership", &self.paths.membership),
            ("paths.election", &self.paths.election),
        ] {
            if value.is_empty() || value.starts_with('/') || value.ends_with('/') {
                return Err(crate::Error::Config(format!(
                    "{} must be a non-empty relative path, got '{}'",
                    name, value
                )));
            }
        }

        if self.ensemble.session_timeout_ms == 0 {
            return Err(crate::Error::Config("ensemble.session_timeout_ms must be positive".into()));
        }

        if self.ensemble.retry_interval_ms == 0 || self.node.listener_retry_ms == 0 {
            return Err(crate::Error::Config("retry intervals must be positive".into()));
        }

        if self.registration.attempts == 0 {
            return Err(crate::Error::Config("registration.attempts must be at least 1".into()));
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        self.ensemble.session_timeout()
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        self.ensemble.connect_timeout()
    }

    /// Get ensemble retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        self.ensemble.retry_interval()
    }

    /// Get listener attachment retry delay as Duration
    pub fn listener_retry(&self) -> Duration {
        Duration::from_millis(self.node.listener_retry_ms)
    }

    /// Get contention retry delay as Duration
    pub fn contend_retry(&self) -> Duration {
        Duration::from_millis(self.election.contend_retry_ms)
    }

    /// Get registration backoff as Duration
    pub fn registration_backoff(&self) -> Duration {
        Duration::from_millis(self.registration.backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
host = "10.0.0.5"

[ensemble]
address = "zk-1:2181"
session_timeout_ms = 30000

[paths]
root = "/tts"
membership = "nodes"
election = "master"

[election]
auto_requeue = true

[state_log]
enabled = true
path = "/tmp/fleet-state.db"
"#;

        let config = FleetNodeConfig::from_str(toml).unwrap();
        assert_eq!(config.node.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.ensemble.address, "zk-1:2181");
        assert_eq!(config.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.paths.membership, "nodes");
        assert!(config.state_log.enabled);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_defaults_from_minimal_config() {
        let config = FleetNodeConfig::from_str("[ensemble]\naddress = \"127.0.0.1:2181\"\n").unwrap();
        assert_eq!(config.ensemble.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.ensemble.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.ensemble.retry_interval(), config.retry_interval());
        assert_eq!(config.paths.root, "/fleet");
        assert_eq!(config.paths.membership, "members");
        assert_eq!(config.paths.election, "leader");
        assert_eq!(config.listener_retry(), Duration::from_secs(1));
        assert_eq!(config.registration.attempts, 3);
        assert!(config.election.auto_requeue);
        assert!(!config.state_log.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let mut config = FleetNodeConfig::with_ensemble("127.0.0.1:2181");
        config.paths.root = "fleet".to_string();
        assert!(config.validate().is_err());

        let mut config = FleetNodeConfig::with_ensemble("127.0.0.1:2181");
        config.paths.membership = "/members".to_string();
        assert!(config.validate().is_err());

        let config = FleetNodeConfig::with_ensemble("");
        assert!(config.validate().is_err());
    }
}
