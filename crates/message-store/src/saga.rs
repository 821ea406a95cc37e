use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, NewOutboxMessage, Result, StoreError};

/// Version of a saga row, used for optimistic concurrency control.
///
/// A row is created at version 1 and every committed transition increments
/// it by one. `Version::initial()` stands for "no row yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The version of a saga that has not been persisted.
    pub fn initial() -> Self {
        Self(0)
    }

    /// The version of a freshly created row.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A persisted saga instance, untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub correlation_id: CorrelationId,
    pub current_state: String,
    pub snapshot: serde_json::Value,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything one saga transition writes, committed as a single unit:
/// the new state row, the outbound messages and the idempotency mark.
#[derive(Debug, Clone)]
pub struct SagaCommit {
    pub saga_type: &'static str,
    pub correlation_id: CorrelationId,
    pub current_state: String,
    pub snapshot: serde_json::Value,
    /// Version the transition was computed from.
    /// `Version::initial()` creates the row.
    pub expected_version: Version,
    pub outbox: Vec<NewOutboxMessage>,
    /// Reserved ledger key to mark processed in the same unit.
    pub idempotency_key: Option<String>,
    pub committed_at: DateTime<Utc>,
}

impl SagaCommit {
    pub fn new(
        saga_type: &'static str,
        correlation_id: CorrelationId,
        current_state: impl Into<String>,
        snapshot: serde_json::Value,
        expected_version: Version,
    ) -> Self {
        Self {
            saga_type,
            correlation_id,
            current_state: current_state.into(),
            snapshot,
            expected_version,
            outbox: Vec::new(),
            idempotency_key: None,
            committed_at: Utc::now(),
        }
    }

    pub fn with_outbox(mut self, messages: Vec<NewOutboxMessage>) -> Self {
        self.outbox = messages;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn committed_at(mut self, at: DateTime<Utc>) -> Self {
        self.committed_at = at;
        self
    }

    /// Version the row holds once the commit succeeds.
    pub fn new_version(&self) -> Version {
        self.expected_version.next()
    }

    pub fn is_creation(&self) -> bool {
        self.expected_version == Version::initial()
    }
}

/// Maps a saga type to its state table, e.g. `wallet_deposit_saga_state`.
pub fn state_table(saga_type: &str) -> Result<String> {
    let valid = !saga_type.is_empty()
        && saga_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_');
    if !valid {
        return Err(StoreError::InvalidSagaType(saga_type.to_string()));
    }
    Ok(format!("{saga_type}_saga_state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(Version::new(1) < Version::new(2));
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::first().as_i64(), 1);
    }

    #[test]
    fn state_table_names() {
        assert_eq!(
            state_table("wallet_deposit").unwrap(),
            "wallet_deposit_saga_state"
        );
        assert!(matches!(
            state_table("wallet; DROP TABLE x"),
            Err(StoreError::InvalidSagaType(_))
        ));
        assert!(state_table("").is_err());
    }

    #[test]
    fn commit_versions() {
        let commit = SagaCommit::new(
            "wallet_deposit",
            CorrelationId::new(),
            "Requested",
            serde_json::json!({}),
            Version::initial(),
        );
        assert!(commit.is_creation());
        assert_eq!(commit.new_version(), Version::first());
    }
}
