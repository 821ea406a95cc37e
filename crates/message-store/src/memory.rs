use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::saga::state_table;
use crate::store::{IdempotencyLedger, OutboxStore, SagaStateStore};
use crate::{
    AggregateId, BeginOutcome, CorrelationId, DeadLetterQuery, EventIdempotency, MessageId,
    NewOutboxMessage, OutboxMessage, OutboxStats, OutboxStatus, Result, SagaCommit, SagaRecord,
    StoreError, Version,
};

#[derive(Default)]
struct Tables {
    outbox: Vec<OutboxMessage>,
    idempotency: HashMap<String, EventIdempotency>,
    sagas: HashMap<(&'static str, CorrelationId), SagaRecord>,
}

impl Tables {
    fn insert_outbox(&mut self, message: NewOutboxMessage) -> MessageId {
        if let Some(ref key) = message.idempotency_key
            && let Some(existing) = self
                .outbox
                .iter()
                .find(|m| m.idempotency_key.as_ref() == Some(key))
        {
            return existing.id;
        }

        let row = message.into_message();
        let id = row.id;
        self.outbox.push(row);
        id
    }

    fn outbox_mut(&mut self, id: MessageId) -> Result<&mut OutboxMessage> {
        self.outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::MessageNotFound(id))
    }

    fn reserved_mut(&mut self, key: &str) -> Result<&mut EventIdempotency> {
        match self.idempotency.get_mut(key) {
            Some(record) if record.is_reserved() => Ok(record),
            _ => Err(StoreError::IdempotencyKeyNotReserved(key.to_string())),
        }
    }
}

/// In-memory message store for tests and single-process runs.
///
/// All three tables sit behind one lock, so a saga commit is atomic with
/// respect to every other operation.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryMessageStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every outbox row in insertion order.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.tables.read().await.outbox.clone()
    }

    /// Returns the total number of outbox rows.
    pub async fn outbox_count(&self) -> usize {
        self.tables.read().await.outbox.len()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.outbox.clear();
        tables.idempotency.clear();
        tables.sagas.clear();
    }
}

#[async_trait]
impl OutboxStore for InMemoryMessageStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<MessageId> {
        Ok(self.tables.write().await.insert_outbox(message))
    }

    async fn fetch_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .outbox
            .iter()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.occurred_on);
        due.truncate(batch_size);
        Ok(due)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn mark_processed(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.outbox_mut(id)?.mark_processed(now))
    }

    async fn save_delivery_failure(&self, message: &OutboxMessage) -> Result<()> {
        let mut tables = self.tables.write().await;
        let row = tables.outbox_mut(message.id)?;
        if row.status() != OutboxStatus::Pending {
            return Ok(());
        }

        row.retry_count = message.retry_count;
        row.next_retry_at = message.next_retry_at;
        row.error = message.error.clone();
        row.failure_reason = message.failure_reason.clone();
        row.is_poison_message = message.is_poison_message;
        row.poisoned_at = message.poisoned_at;
        Ok(())
    }

    async fn list_dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<OutboxMessage>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .outbox
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.poisoned_at);

        let rows = rows.into_iter().skip(query.offset.unwrap_or(0));
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn move_to_dlq(&self, id: MessageId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let row = tables.outbox_mut(id)?;
        if !row.is_poison_message {
            return Err(StoreError::NotPoisoned(id));
        }
        row.moved_to_dlq_at = Some(now);
        row.dlq_reason = Some(reason.to_string());
        Ok(())
    }

    async fn replay(&self, id: MessageId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let row = tables.outbox_mut(id)?;
        if !row.is_poison_message {
            return Err(StoreError::NotPoisoned(id));
        }
        row.is_poison_message = false;
        row.poisoned_at = None;
        row.moved_to_dlq_at = None;
        row.dlq_reason = None;
        row.retry_count = 0;
        row.next_retry_at = None;
        row.error = None;
        row.failure_reason = None;
        Ok(())
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.outbox.len();
        tables.outbox.retain(|m| {
            m.is_poison_message || m.processed_on.is_none_or(|at| at >= older_than)
        });
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let tables = self.tables.read().await;
        let mut stats = OutboxStats::default();
        for row in &tables.outbox {
            match row.status() {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processed => stats.processed += 1,
                OutboxStatus::Poisoned => stats.poisoned += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryMessageStore {
    async fn try_begin(&self, key: &str, aggregate_id: Option<AggregateId>) -> Result<BeginOutcome> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.idempotency.get(key) {
            return Ok(existing.begin_outcome());
        }
        tables.idempotency.insert(
            key.to_string(),
            EventIdempotency::reserve(key, aggregate_id, Utc::now()),
        );
        Ok(BeginOutcome::Proceed)
    }

    async fn mark_processed(&self, key: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables.reserved_mut(key)?;
        record.is_processed = true;
        record.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables.reserved_mut(key)?;
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.idempotency.get(key) {
            Some(record) if record.is_processed => {
                Err(StoreError::IdempotencyKeyNotReserved(key.to_string()))
            }
            Some(_) => {
                tables.idempotency.remove(key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<EventIdempotency>> {
        Ok(self.tables.read().await.idempotency.get(key).cloned())
    }

    async fn reclaim_stale(&self, reserved_before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.idempotency.len();
        tables
            .idempotency
            .retain(|_, r| !(r.is_reserved() && r.reserved_at < reserved_before));
        Ok((before - tables.idempotency.len()) as u64)
    }
}

#[async_trait]
impl SagaStateStore for InMemoryMessageStore {
    async fn load_saga(
        &self,
        saga_type: &'static str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        state_table(saga_type)?;
        let tables = self.tables.read().await;
        Ok(tables.sagas.get(&(saga_type, correlation_id)).cloned())
    }

    async fn commit_saga(&self, commit: SagaCommit) -> Result<Version> {
        state_table(commit.saga_type)?;
        let mut tables = self.tables.write().await;
        let slot = (commit.saga_type, commit.correlation_id);

        // Validate everything before touching any table.
        let actual = tables
            .sagas
            .get(&slot)
            .map(|r| r.version)
            .unwrap_or(Version::initial());
        if actual != commit.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                saga_type: commit.saga_type.to_string(),
                correlation_id: commit.correlation_id,
                expected: commit.expected_version,
                actual,
            });
        }
        if let Some(ref key) = commit.idempotency_key {
            tables.reserved_mut(key)?;
        }

        let version = commit.new_version();
        let created_at = tables
            .sagas
            .get(&slot)
            .map(|r| r.created_at)
            .unwrap_or(commit.committed_at);
        tables.sagas.insert(
            slot,
            SagaRecord {
                correlation_id: commit.correlation_id,
                current_state: commit.current_state,
                snapshot: commit.snapshot,
                version,
                created_at,
                updated_at: commit.committed_at,
            },
        );

        for message in commit.outbox {
            tables.insert_outbox(message);
        }

        if let Some(ref key) = commit.idempotency_key {
            let record = tables.reserved_mut(key)?;
            record.is_processed = true;
            record.processed_at = Some(commit.committed_at);
        }

        Ok(version)
    }

    async fn find_sagas(&self, saga_type: &'static str, state: &str) -> Result<Vec<SagaRecord>> {
        state_table(saga_type)?;
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .sagas
            .iter()
            .filter(|((t, _), r)| *t == saga_type && r.current_state == state)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
