//! Error types for the messaging layer.

use std::io;
use thiserror::Error;

use crate::{config::ConfigError, verbs::WcStatus};

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, RdmaError>;

/// Errors that can occur in messaging operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RdmaError {
    /// The connection is not (or no longer) connected
    #[error("Connection is not connected")]
    NotConnected,

    /// Flow control denied the operation and it could not be deferred
    #[error("Operation would block: {0}")]
    WouldBlock(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The peer sent a control message that could not be decoded
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Queue pair error
    #[error("Queue pair error: {0}")]
    QpError(String),

    /// A work request completed with a non-success status
    #[error("Work request completed with status {0:?}")]
    Completion(WcStatus),

    /// Memory registration error
    #[error("Memory registration error: {0}")]
    MemoryError(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RdmaError {
    /// Returns `true` for failures that are an expected consequence of load,
    /// where retrying the same call later is the correct reaction.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            *self,
            RdmaError::WouldBlock(_) | RdmaError::ResourceExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backpressure_errors_are_retryable() {
        assert!(RdmaError::WouldBlock("queue full".into()).is_retryable());
        assert!(RdmaError::ResourceExhausted("pool".into()).is_retryable());
        assert!(!RdmaError::NotConnected.is_retryable());
        assert!(!RdmaError::Completion(WcStatus::RemoteAccessError).is_retryable());
        assert!(!RdmaError::Protocol("bad tag".into()).is_retryable());
    }
}
