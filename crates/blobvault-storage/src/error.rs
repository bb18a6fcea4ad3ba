//! Error types for blobvault-storage
//!
//! Every fallible operation in the crate returns [`StorageError`]. Only
//! [`StorageError::Conflict`] is considered transient; the retrying
//! executor re-runs a transaction body for that variant and nothing else.

use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Optimistic-concurrency check failed; another writer committed first
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// A transaction kept conflicting until the retry budget ran out
    #[error("Transaction conflict persisted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first one
        attempts: u32,
        /// Message of the last conflict observed
        last: String,
    },

    /// The store could not be reached (I/O failure, closed database, timeout)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// An index operation was invoked before `start()` completed
    #[error("Index has not been started")]
    NotStarted,

    /// Non-transient database error
    #[error("Database error: {0}")]
    Database(String),

    /// Table was never registered, or was registered with another shape
    #[error("Schema error: {0}")]
    Schema(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Blob identifier rejected by validation
    #[error("Invalid blob id: {0}")]
    InvalidBlobId(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Create a new Conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a new Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a new Schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether re-running the transaction on a fresh snapshot may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// Convert from postcard Error to StorageError
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Io(e) => StorageError::Unavailable(e.to_string()),
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::Storage(e) => e.into(),
            redb::DatabaseError::DatabaseAlreadyOpen => {
                StorageError::Unavailable("database is already open".to_string())
            }
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(e) => e.into(),
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(e) => e.into(),
            redb::TableError::TableDoesNotExist(name) => {
                StorageError::Schema(format!("table '{name}' is not registered"))
            }
            other => StorageError::Schema(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        match err {
            redb::CommitError::Storage(e) => e.into(),
            other => StorageError::Database(other.to_string()),
        }
    }
}
