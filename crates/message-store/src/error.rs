use thiserror::Error;

use crate::{CorrelationId, MessageId, Version};

/// Errors that can occur when interacting with the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The saga row changed since it was loaded.
    #[error(
        "Concurrency conflict for {saga_type} saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_type: String,
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// No outbox row with this id.
    #[error("Outbox message not found: {0}")]
    MessageNotFound(MessageId),

    /// A dead-letter operation targeted a message that is not poisoned.
    #[error("Outbox message {0} is not poisoned")]
    NotPoisoned(MessageId),

    /// The idempotency key is not in the reserved state.
    #[error("Idempotency key is not reserved: {0}")]
    IdempotencyKeyNotReserved(String),

    /// The saga type cannot be mapped to a state table.
    #[error("Invalid saga type: {0}")]
    InvalidSagaType(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for a stale saga version.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }

    /// Returns true when repeating the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Database(_)
        )
    }
}

/// Result type for message store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
