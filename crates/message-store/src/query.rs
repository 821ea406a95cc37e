use crate::{AggregateId, CorrelationId, OutboxMessage};

/// Builder for dead-letter queries.
///
/// Only poisoned rows are ever returned; the filters narrow that set.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by short message type.
    pub message_type: Option<String>,

    /// Filter by saga correlation id.
    pub correlation_id: Option<CorrelationId>,

    /// Filter by owning aggregate.
    pub aggregate_id: Option<AggregateId>,

    /// `Some(true)` for rows already moved to the DLQ, `Some(false)` for rows
    /// still awaiting operator action.
    pub moved_to_dlq: Option<bool>,

    /// Maximum number of rows to return.
    pub limit: Option<usize>,

    /// Number of rows to skip.
    pub offset: Option<usize>,
}

impl DeadLetterQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Only rows not yet moved to the DLQ.
    pub fn awaiting_action(mut self) -> Self {
        self.moved_to_dlq = Some(false);
        self
    }

    /// Only rows already moved to the DLQ.
    pub fn moved(mut self) -> Self {
        self.moved_to_dlq = Some(true);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if `message` is poisoned and passes every filter.
    pub fn matches(&self, message: &OutboxMessage) -> bool {
        if !message.is_poison_message {
            return false;
        }
        if let Some(ref message_type) = self.message_type
            && &message.message_type != message_type
        {
            return false;
        }
        if let Some(id) = self.correlation_id
            && message.correlation_id != Some(id)
        {
            return false;
        }
        if let Some(id) = self.aggregate_id
            && message.aggregate_id != Some(id)
        {
            return false;
        }
        if let Some(moved) = self.moved_to_dlq
            && message.moved_to_dlq_at.is_some() != moved
        {
            return false;
        }
        true
    }
}
