//! Outbox rows and their delivery lifecycle.

use chrono::{DateTime, Utc};
use contracts::{IntegrationMessage, MessageEnvelope};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{AggregateId, CorrelationId, MessageId};

/// Default number of publish attempts before a row is quarantined.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Delivery status derived from an outbox row.
///
/// Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Poisoned,
}

/// What happened to a row after a failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The row stays pending and becomes due again at `next_retry_at`.
    Retry { next_retry_at: DateTime<Utc> },
    /// The row exhausted its retries and is quarantined.
    Poisoned,
}

/// One event awaiting (or done with) publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,

    /// Short registry name of the payload, e.g. `BillFullyPaidEventMessage`.
    pub message_type: String,
    pub full_type_name: String,
    pub assembly_name: String,
    pub content: serde_json::Value,
    pub schema_version: i32,

    pub occurred_on: DateTime<Utc>,
    /// `None` while pending.
    pub processed_on: Option<DateTime<Utc>>,

    pub idempotency_key: Option<String>,
    pub aggregate_id: Option<AggregateId>,
    pub correlation_id: Option<CorrelationId>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure_reason: Option<String>,

    pub is_poison_message: bool,
    pub poisoned_at: Option<DateTime<Utc>>,
    pub moved_to_dlq_at: Option<DateTime<Utc>>,
    pub dlq_reason: Option<String>,
}

impl OutboxMessage {
    /// Returns the delivery status.
    pub fn status(&self) -> OutboxStatus {
        if self.is_poison_message {
            OutboxStatus::Poisoned
        } else if self.processed_on.is_some() {
            OutboxStatus::Processed
        } else {
            OutboxStatus::Pending
        }
    }

    /// Returns true if the row should be picked up by a dispatch pass at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status() == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Marks the row processed. Returns false if it was not pending.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status() != OutboxStatus::Pending {
            return false;
        }
        self.processed_on = Some(now);
        self.next_retry_at = None;
        true
    }

    /// Records a failed publish attempt and schedules the next one, or
    /// quarantines the row once `max_retries` attempts have failed.
    pub fn register_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        self.retry_count += 1;
        self.error = Some(error.into());

        if self.retry_count < self.max_retries {
            let next_retry_at = policy.next_attempt_at(self.retry_count, now);
            self.next_retry_at = Some(next_retry_at);
            self.failure_reason = Some(format!(
                "publish attempt {} of {} failed",
                self.retry_count, self.max_retries
            ));
            FailureOutcome::Retry { next_retry_at }
        } else {
            self.retry_count = self.max_retries;
            self.poison(
                format!("exceeded {} publish attempts", self.max_retries),
                now,
            );
            FailureOutcome::Poisoned
        }
    }

    /// Quarantines the row immediately.
    pub fn poison(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.is_poison_message = true;
        self.poisoned_at = Some(now);
        self.next_retry_at = None;
        self.failure_reason = Some(reason.into());
    }

    /// Builds the transport envelope for this row.
    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.id,
            message_type: self.message_type.clone(),
            full_type_name: self.full_type_name.clone(),
            schema_version: self.schema_version,
            content: self.content.clone(),
            occurred_on: self.occurred_on,
            idempotency_key: self.idempotency_key.clone(),
            aggregate_id: self.aggregate_id,
            correlation_id: self.correlation_id,
        }
    }
}

/// A row to be enqueued.
///
/// Built from a typed message so the payload descriptors always come from
/// the schema registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    pub id: MessageId,
    pub message_type: String,
    pub full_type_name: String,
    pub assembly_name: String,
    pub content: serde_json::Value,
    pub schema_version: i32,
    pub occurred_on: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub aggregate_id: Option<AggregateId>,
    pub correlation_id: Option<CorrelationId>,
    pub max_retries: i32,
    /// Earliest delivery time for scheduled messages.
    pub deliver_after: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    /// Describes `message` for the outbox.
    pub fn for_message(message: &IntegrationMessage) -> Result<Self, serde_json::Error> {
        let kind = message.kind();
        Ok(Self {
            id: MessageId::new(),
            message_type: kind.type_name().to_string(),
            full_type_name: kind.full_type_name().to_string(),
            assembly_name: kind.assembly_name().to_string(),
            content: message.to_content()?,
            schema_version: kind.schema_version(),
            occurred_on: Utc::now(),
            idempotency_key: None,
            aggregate_id: None,
            correlation_id: None,
            max_retries: DEFAULT_MAX_RETRIES,
            deliver_after: None,
        })
    }

    /// Sets the producer idempotency key (unique across the outbox).
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the owning business entity.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the saga instance this message belongs to.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Overrides the number of publish attempts before quarantine.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Holds the message back until `at`.
    pub fn deliver_after(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_after = Some(at);
        self
    }

    /// Overrides the occurrence timestamp.
    pub fn occurred_on(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_on = at;
        self
    }

    /// Converts into a pending row.
    pub fn into_message(self) -> OutboxMessage {
        OutboxMessage {
            id: self.id,
            message_type: self.message_type,
            full_type_name: self.full_type_name,
            assembly_name: self.assembly_name,
            content: self.content,
            schema_version: self.schema_version,
            occurred_on: self.occurred_on,
            processed_on: None,
            idempotency_key: self.idempotency_key,
            aggregate_id: self.aggregate_id,
            correlation_id: self.correlation_id,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: self.deliver_after,
            error: None,
            failure_reason: None,
            is_poison_message: false,
            poisoned_at: None,
            moved_to_dlq_at: None,
            dlq_reason: None,
        }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub processed: u64,
    pub poisoned: u64,
}
