//! Operator actions on quarantined outbox rows.

use chrono::Utc;
use message_store::{DeadLetterQuery, MessageId, OutboxMessage, OutboxStats, OutboxStore};

use crate::Result;

/// Lists, exports and replays poisoned outbox rows.
pub struct DeadLetterService<S: OutboxStore> {
    store: S,
}

impl<S: OutboxStore> DeadLetterService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, query: DeadLetterQuery) -> Result<Vec<OutboxMessage>> {
        let letters = self.store.list_dead_letters(query).await?;
        tracing::info!(count = letters.len(), "listed dead letters");
        Ok(letters)
    }

    /// Records that a poisoned row was exported to the dead-letter queue.
    #[tracing::instrument(skip(self))]
    pub async fn move_to_dlq(&self, id: MessageId, reason: &str) -> Result<()> {
        self.store.move_to_dlq(id, reason, Utc::now()).await?;
        metrics::counter!("outbox_messages_moved_to_dlq_total").increment(1);
        tracing::info!(%id, reason, "message moved to dead-letter queue");
        Ok(())
    }

    /// Puts a poisoned row back into the pending set with a fresh retry budget.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, id: MessageId) -> Result<()> {
        self.store.replay(id).await?;
        metrics::counter!("outbox_messages_replayed_total").increment(1);
        tracing::info!(%id, "message replayed");
        Ok(())
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        Ok(self.store.stats().await?)
    }
}
