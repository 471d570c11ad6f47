//! Error types for the objsync storage core
//!
//! The same error enum is shared by the document store, the payload store
//! and the lifecycle engine, so callers can dispatch on error kind without
//! caring which layer produced it.

use thiserror::Error;

/// Common result type for objsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the storage core
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed data URI or unsupported scheme
    #[error("invalid data URI: {0}")]
    InvalidUri(String),

    /// Read/write/rename/short-read failure at the payload store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity absent; distinct from I/O failures
    #[error("not found")]
    NotFound,

    /// Insert collided with an existing primary key
    #[error("duplicate key")]
    Duplicate,

    /// Chunk rejected because the out-of-order window is full;
    /// the transport is expected to retransmit
    #[error("chunk discarded: {0}")]
    Discarded(String),

    /// Optimistic-update precondition failed and local retries ran out
    #[error("update conflict: {0}")]
    Conflict(String),

    /// The persistence backend cannot be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Any other failure at the persistence layer
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid-URI error
    pub fn invalid_uri(msg: impl Into<String>) -> Self {
        Self::InvalidUri(msg.into())
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this is a duplicate-key error
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// Check if this is a discarded-chunk error
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded(_))
    }

    /// Check if the operation may succeed when retried against the backend
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::NotFound.is_not_found());
        assert!(Error::Duplicate.is_duplicate());
        assert!(Error::Discarded("window full".into()).is_discarded());
        assert!(Error::Unavailable("dial".into()).is_retryable());
        assert!(!Error::storage("boom").is_retryable());
    }
}
