use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AggregateId, BeginOutcome, CorrelationId, DeadLetterQuery, EventIdempotency, MessageId,
    NewOutboxMessage, OutboxMessage, OutboxStats, Result, SagaCommit, SagaRecord, Version,
};

/// Durable outbox of integration events.
///
/// Rows are written alongside business state and published later by a
/// dispatcher; nothing here talks to a transport.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Writes one pending row.
    ///
    /// If a row with the same idempotency key exists, nothing is written and
    /// the existing row's id is returned.
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<MessageId>;

    /// Pending rows due at `now`, oldest first.
    async fn fetch_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>>;

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Sets `processed_on`. Returns false without change if the row is
    /// already processed or poisoned.
    async fn mark_processed(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool>;

    /// Persists the retry and poison columns of a pending row.
    async fn save_delivery_failure(&self, message: &OutboxMessage) -> Result<()>;

    /// Poisoned rows matching the query, oldest first.
    async fn list_dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<OutboxMessage>>;

    /// Records that a poisoned row was exported to the dead-letter queue.
    async fn move_to_dlq(&self, id: MessageId, reason: &str, now: DateTime<Utc>) -> Result<()>;

    /// Makes a poisoned row pending again with a fresh retry budget.
    async fn replay(&self, id: MessageId) -> Result<()>;

    /// Deletes rows processed before `older_than`. Returns the number removed.
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<OutboxStats>;
}

/// Deduplication records for at-least-once consumers.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically reserves `key`. Exactly one concurrent caller per key
    /// observes [`BeginOutcome::Proceed`].
    async fn try_begin(&self, key: &str, aggregate_id: Option<AggregateId>) -> Result<BeginOutcome>;

    /// Moves a reserved key to processed.
    async fn mark_processed(&self, key: &str) -> Result<()>;

    /// Moves a reserved key to failed, recording the error.
    async fn mark_failed(&self, key: &str, error: &str) -> Result<()>;

    /// Drops an unprocessed reservation so the message can be redelivered.
    async fn release(&self, key: &str) -> Result<()>;

    async fn get_record(&self, key: &str) -> Result<Option<EventIdempotency>>;

    /// Releases reservations taken before `reserved_before` that never
    /// completed. Returns the number released.
    async fn reclaim_stale(&self, reserved_before: DateTime<Utc>) -> Result<u64>;
}

/// Saga instance rows, one table per saga type.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    async fn load_saga(
        &self,
        saga_type: &'static str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>>;

    /// Applies a transition atomically: the state row (checked against
    /// `expected_version`), the outbox rows and the idempotency mark either
    /// all commit or none do.
    ///
    /// Returns the row's new version.
    async fn commit_saga(&self, commit: SagaCommit) -> Result<Version>;

    /// Instances currently in `state`.
    async fn find_sagas(&self, saga_type: &'static str, state: &str) -> Result<Vec<SagaRecord>>;
}

/// A backend providing all three tables.
pub trait MessageStore: OutboxStore + IdempotencyLedger + SagaStateStore {}

impl<T: OutboxStore + IdempotencyLedger + SagaStateStore + ?Sized> MessageStore for T {}
