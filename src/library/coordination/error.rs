use thiserror::Error;

/// Failure of a [`CoordinationStore`](super::CoordinationStore) operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Node (or for creation, its parent) does not exist
    #[error("node does not exist: {0}")]
    NoNode(String),
    /// Node already exists
    #[error("node already exists: {0}")]
    NodeExists(String),
    /// Node has been modified since the version the caller expected
    #[error("node has been modified concurrently: {0}")]
    BadVersion(String),
    /// Node can not be deleted because it has children
    #[error("node has children: {0}")]
    NotEmpty(String),
    /// Path is not a well-formed absolute path
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Operation did not complete within the configured operation timeout
    #[error("operation timed out")]
    Timeout,
    /// Session is suspended, lost or closed
    #[error("connection unavailable")]
    ConnectionLoss,
    /// Backend reported an error
    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CoordinationError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            CoordinationError::Timeout
        } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            CoordinationError::ConnectionLoss
        } else {
            CoordinationError::Backend(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for CoordinationError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoordinationError::Timeout
    }
}
