//! Error types for tallystore
//!
//! This module defines the error type shared by the buffer pool, the codecs
//! and the redb-backed stores.

use thiserror::Error;

/// Common result type for tallystore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tallystore
#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation cancelled")]
    Cancelled,

    // Schema errors
    #[error("schema mismatch: expected {expected}, found {actual}")]
    SchemaMismatch { expected: String, actual: String },

    // Record errors
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("no free disambiguator left for content hash {hash:#018x}")]
    DisambiguatorExhausted { hash: u64 },

    #[error("key too long: {len} bytes, max {max} bytes")]
    KeyTooLong { len: usize, max: usize },

    // Engine errors
    #[error("transaction failure: {0}")]
    Transaction(Box<redb::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a corrupt record error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptRecord(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a resource exhausted error
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Check if this is a retryable error.
    ///
    /// Only a pool wait that ran out of patience qualifies; the caller owns
    /// the retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    /// Check if this error must never be retried automatically
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. }
                | Self::CorruptRecord(_)
                | Self::DisambiguatorExhausted { .. }
                | Self::Configuration(_)
        )
    }

    /// Check if this is a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Self::Transaction(Box::new(e))
    }
}

macro_rules! from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Self::Transaction(Box::new(redb::Error::from(e)))
                }
            }
        )*
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    redb::CompactionError,
);

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::exhausted("pool").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::corrupt("bad").is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::SchemaMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_fatal());
        assert!(Error::DisambiguatorExhausted { hash: 1 }.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_error_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::exhausted("pool").is_cancelled());
    }

    #[test]
    fn test_redb_conversion() {
        let err: Error = redb::StorageError::Corrupted("page".into()).into();
        assert!(matches!(err, Error::Transaction(_)));
        assert!(err.to_string().starts_with("transaction failure"));
    }
}
