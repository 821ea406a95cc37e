use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Result of reserving an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The key was free and is now reserved by this caller.
    Proceed,
    /// A previous delivery already completed.
    AlreadyProcessed,
    /// Another delivery holds the key, or a previous one failed.
    InFlight,
}

impl BeginOutcome {
    /// Returns true if the caller owns the reservation.
    pub fn should_proceed(&self) -> bool {
        matches!(self, BeginOutcome::Proceed)
    }
}

/// One row of the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventIdempotency {
    pub id: Uuid,
    pub idempotency_key: String,
    pub aggregate_id: Option<AggregateId>,
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub reserved_at: DateTime<Utc>,
}

impl EventIdempotency {
    /// Creates a fresh reservation.
    pub fn reserve(
        key: impl Into<String>,
        aggregate_id: Option<AggregateId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: key.into(),
            aggregate_id,
            is_processed: false,
            processed_at: None,
            error: None,
            reserved_at: now,
        }
    }

    /// Reserved and neither processed nor failed.
    pub fn is_reserved(&self) -> bool {
        !self.is_processed && self.error.is_none()
    }

    pub fn is_failed(&self) -> bool {
        !self.is_processed && self.error.is_some()
    }

    /// What a second `try_begin` on this key observes.
    pub fn begin_outcome(&self) -> BeginOutcome {
        if self.is_processed {
            BeginOutcome::AlreadyProcessed
        } else {
            BeginOutcome::InFlight
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_reservation_is_in_flight_for_others() {
        let record = EventIdempotency::reserve("bill-paid:1", None, Utc::now());
        assert!(record.is_reserved());
        assert!(!record.is_failed());
        assert_eq!(record.begin_outcome(), BeginOutcome::InFlight);
    }

    #[test]
    fn failed_record_stays_in_flight() {
        let mut record = EventIdempotency::reserve("bill-paid:1", None, Utc::now());
        record.error = Some("boom".to_string());
        assert!(record.is_failed());
        assert_eq!(record.begin_outcome(), BeginOutcome::InFlight);
    }

    #[test]
    fn processed_record_reports_duplicate() {
        let mut record = EventIdempotency::reserve("bill-paid:1", None, Utc::now());
        record.is_processed = true;
        record.processed_at = Some(Utc::now());
        assert_eq!(record.begin_outcome(), BeginOutcome::AlreadyProcessed);
        assert!(!record.begin_outcome().should_proceed());
    }
}
