//! Error types for the dotdb engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in dotdb engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed path or out-of-range array index.
    #[error("path error: {message}")]
    Path {
        /// Description of the path problem.
        message: String,
    },

    /// Operation requires a value of a different shape.
    #[error("type error: {message}")]
    Type {
        /// Description of the shape mismatch.
        message: String,
    },

    /// Schema rejected the incoming value; the mutation was not applied.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the constraint violation.
        message: String,
    },

    /// Unknown index name.
    #[error("no such index: {name}")]
    Index {
        /// The index name that was looked up.
        name: String,
    },

    /// Could not acquire the required file lock within the timeout.
    #[error("lock error: {message}")]
    Lock {
        /// Description of the lock failure.
        message: String,
    },

    /// Mutation attempted while holding a shared lock.
    #[error("database is read-only under a shared lock")]
    ReadOnly,

    /// Snapshot, WAL, or sidecar I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CRC mismatch or parse failure in persisted data.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A savepoint name was not found on rollback.
    #[error("no such savepoint: {name}")]
    TxConflict {
        /// The savepoint name that was looked up.
        name: String,
    },

    /// JSON encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] dotdb_codec::CodecError),

    /// Operation attempted after close.
    #[error("database is closed")]
    Closed,
}

impl CoreError {
    /// Creates a path error.
    pub fn path(message: impl Into<String>) -> Self {
        Self::Path {
            message: message.into(),
        }
    }

    /// Creates a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an unknown-index error.
    pub fn no_such_index(name: impl Into<String>) -> Self {
        Self::Index { name: name.into() }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an unknown-savepoint error.
    pub fn no_such_savepoint(name: impl Into<String>) -> Self {
        Self::TxConflict { name: name.into() }
    }
}
