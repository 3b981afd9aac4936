//! Slate Error Types

use thiserror::Error;

/// Result type alias for Slate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Slate error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Replication errors
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Counter exhausted for node {0}")]
    CounterExhausted(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unexpected response from {peer}: {got}")]
    UnexpectedResponse { peer: String, got: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the peer could not be reached this round
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must stop the node
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CounterExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::ConnectionTimeout("10.0.0.2:7654".into()).is_unreachable());
        assert!(Error::Network("reset".into()).is_unreachable());
        assert!(!Error::MalformedRecord("empty key".into()).is_unreachable());
        assert!(Error::CounterExhausted("node-1".into()).is_fatal());
        assert!(!Error::Storage("disk full".into()).is_fatal());
    }
}
