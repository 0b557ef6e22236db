//! Storage error types.

use thiserror::Error;

/// Errors from storage backends and the orchestrator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error ({backend}): {message}")]
    Backend { backend: &'static str, message: String },

    #[error("endpoint circuit open: {0}")]
    CircuitOpen(String),

    #[error("all storage endpoints failed for {key}: {detail}")]
    AllEndpointsFailed { key: String, detail: String },

    #[error("replication quorum not met: {0}")]
    QuorumNotMet(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl StorageError {
    /// Whether a read should fall through to the next endpoint.
    ///
    /// NotFound counts as retryable on another endpoint: a blob missing on
    /// one replica may still exist on the others.
    pub fn is_failover_eligible(&self) -> bool {
        !matches!(self, StorageError::InvalidKey(_) | StorageError::InvalidRange(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
