//! Saga error types.

use common::CorrelationId;
use contracts::ContractError;
use message_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga row changed between load and commit. Reload and retry.
    #[error("Concurrency conflict on {saga_type} saga {correlation_id}")]
    ConcurrencyConflict {
        saga_type: String,
        correlation_id: CorrelationId,
    },

    /// A starting message cannot create the requested instance.
    #[error("Cannot start {saga_type} saga {correlation_id}: {reason}")]
    InvalidStart {
        saga_type: &'static str,
        correlation_id: CorrelationId,
        reason: String,
    },

    /// The persisted row cannot be read back into a typed instance.
    #[error("Corrupt {saga_type} saga {correlation_id}: {reason}")]
    CorruptState {
        saga_type: &'static str,
        correlation_id: CorrelationId,
        reason: String,
    },

    /// Message store error.
    #[error("Message store error: {0}")]
    Store(StoreError),

    /// Message contract error.
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, SagaError::ConcurrencyConflict { .. })
    }

    /// Returns true when the idempotency reservation for the trigger was
    /// gone at commit time.
    pub fn is_lost_reservation(&self) -> bool {
        matches!(self, SagaError::Store(StoreError::IdempotencyKeyNotReserved(_)))
    }

    /// Returns true when delivering the same trigger again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::ConcurrencyConflict { .. } => true,
            SagaError::Store(e) => e.is_transient() || self.is_lost_reservation(),
            _ => false,
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConcurrencyConflict {
                saga_type,
                correlation_id,
                ..
            } => SagaError::ConcurrencyConflict {
                saga_type,
                correlation_id,
            },
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use message_store::{MessageId, Version};

    use super::*;

    #[test]
    fn store_conflict_becomes_retryable_saga_conflict() {
        let error = SagaError::from(StoreError::ConcurrencyConflict {
            saga_type: "wallet_deposit".to_string(),
            correlation_id: CorrelationId::new(),
            expected: Version::first(),
            actual: Version::new(2),
        });
        assert!(error.is_concurrency_conflict());
        assert!(error.is_retryable());
    }

    #[test]
    fn missing_row_is_not_retryable() {
        let error = SagaError::from(StoreError::MessageNotFound(MessageId::new()));
        assert!(matches!(error, SagaError::Store(_)));
        assert!(!error.is_retryable());
    }

    #[test]
    fn lost_reservation_is_retryable() {
        let error = SagaError::from(StoreError::IdempotencyKeyNotReserved(
            "wallet_deposit:reclaimed".to_string(),
        ));
        assert!(error.is_lost_reservation());
        assert!(error.is_retryable());
    }
}
