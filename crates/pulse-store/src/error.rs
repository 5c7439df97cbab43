//! Error types for the persistence layer.

/// The result type used throughout pulse-store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row could not be decoded into its domain type.
    #[error("invalid row: {message}")]
    InvalidRow {
        /// Description of the decoding failure.
        message: String,
    },

    /// A value could not be serialized for storage.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a new invalid-row error.
    #[must_use]
    pub fn invalid_row(message: impl Into<String>) -> Self {
        Self::InvalidRow {
            message: message.into(),
        }
    }
}
