use thiserror::Error;

/// Errors that can occur when interacting with the ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transaction observed a document that changed before commit, or
    /// tried to create a document that already exists.
    ///
    /// Conflicts are safe to retry from the beginning of the transaction.
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped back into a document.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A batch exceeded the store's write-size limit.
    #[error("Batch of {size} writes exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
}

impl StoreError {
    /// Returns true if retrying the whole transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result type for ledger store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
