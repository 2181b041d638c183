//! FleetNode Error Types

use thiserror::Error;

/// Result type alias for FleetNode operations
pub type Result<T> = std::result::Result<T, Error>;

/// FleetNode error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Ensemble errors
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to ensemble lost: {0}")]
    ConnectionLoss(String),

    #[error("Ensemble session expired")]
    SessionExpired,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Frame serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State log errors
    #[error("State error: {0}")]
    State(String),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    #[error("Leadership task failed: {0}")]
    LeadershipTask(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Component not started: {0}")]
    NotStarted(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means the ensemble discarded our session
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }
}
