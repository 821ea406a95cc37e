//! Durable storage for the reliable-messaging core.
//!
//! Three tables live side by side so that a business or saga write can
//! commit them in one atomic unit:
//! - the outbox (`outbox_messages`): events awaiting publication,
//! - the idempotency ledger (`event_idempotency`): dedup records,
//! - saga state (`<saga_type>_saga_state`): one row per process instance.

pub mod error;
pub mod idempotency;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod query;
pub mod retry;
pub mod saga;
pub mod store;

pub use common::{AggregateId, CorrelationId, MessageId};
pub use error::{Result, StoreError};
pub use idempotency::{BeginOutcome, EventIdempotency};
pub use memory::InMemoryMessageStore;
pub use outbox::{FailureOutcome, NewOutboxMessage, OutboxMessage, OutboxStats, OutboxStatus};
pub use postgres::{PostgresMessageStore, enqueue_in_transaction};
pub use query::DeadLetterQuery;
pub use retry::RetryPolicy;
pub use saga::{SagaCommit, SagaRecord, Version};
pub use store::{IdempotencyLedger, MessageStore, OutboxStore, SagaStateStore};
