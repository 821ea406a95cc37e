//! Saga definitions as pure state machines.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use contracts::{IntegrationMessage, MessageKind};
use message_store::NewOutboxMessage;
use serde::{Serialize, de::DeserializeOwned};

/// The enumerated state of one saga type.
pub trait SagaState: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Every state, used to parse persisted names.
    const ALL: &'static [Self];

    /// Name stored in the `current_state` column.
    fn as_str(&self) -> &'static str;

    /// Terminal states are absorbing: no trigger leaves them.
    fn is_terminal(&self) -> bool;

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == name)
    }
}

/// A message a transition asks to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub message: IntegrationMessage,
    /// Outbox idempotency key; a second enqueue with the same key is a no-op.
    pub idempotency_key: Option<String>,
    /// Scheduled delivery time, used for timeouts.
    pub deliver_after: Option<DateTime<Utc>>,
}

impl Outbound {
    pub fn new(message: impl Into<IntegrationMessage>) -> Self {
        Self {
            message: message.into(),
            idempotency_key: None,
            deliver_after: None,
        }
    }

    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn deliver_after(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_after = Some(at);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Describes this message as an outbox row owned by `correlation_id`.
    pub fn into_outbox(
        self,
        correlation_id: CorrelationId,
    ) -> Result<NewOutboxMessage, serde_json::Error> {
        let mut row = NewOutboxMessage::for_message(&self.message)?
            .correlation_id(correlation_id)
            .aggregate_id(AggregateId::from(correlation_id));
        if let Some(key) = self.idempotency_key {
            row = row.idempotency_key(key);
        }
        if let Some(at) = self.deliver_after {
            row = row.deliver_after(at);
        }
        Ok(row)
    }
}

/// Result of feeding one trigger to a saga in a given state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<S, D> {
    /// Move to `to`, replace the snapshot and publish `outbound`.
    Advance {
        to: S,
        data: D,
        outbound: Vec<Outbound>,
    },
    /// The trigger has no effect in this state.
    Ignore { reason: String },
    /// The trigger arrived before its prerequisite; redeliver later.
    Defer { reason: String },
}

impl<S, D> Transition<S, D> {
    pub fn advance(to: S, data: D) -> Self {
        Transition::Advance {
            to,
            data,
            outbound: Vec::new(),
        }
    }

    pub fn ignore(reason: impl Into<String>) -> Self {
        Transition::Ignore {
            reason: reason.into(),
        }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        Transition::Defer {
            reason: reason.into(),
        }
    }

    /// Appends an outbound message to an `Advance`. No-op otherwise.
    pub fn emit(mut self, message: Outbound) -> Self {
        if let Transition::Advance { outbound, .. } = &mut self {
            outbound.push(message);
        }
        self
    }
}

/// A saga type: its states, snapshot and pure transition function.
///
/// Implementations hold no I/O; persistence, idempotency and publishing are
/// handled by [`SagaRuntime`](crate::SagaRuntime).
pub trait SagaDefinition: Send + Sync + 'static {
    /// Saga type name; also selects the `<saga_type>_saga_state` table.
    const SAGA_TYPE: &'static str;

    type State: SagaState;
    type Data: Serialize + DeserializeOwned + Default + Clone + Debug + Send + Sync;

    /// Every edge `transition` may take, as `(from, trigger, to)`.
    const EDGES: &'static [(Self::State, MessageKind, Self::State)];

    /// State of an instance that has not been persisted yet.
    fn initial_state() -> Self::State;

    /// The instance a message belongs to, or `None` if this saga does not
    /// consume it.
    fn correlate(message: &IntegrationMessage) -> Option<CorrelationId>;

    /// Whether `message` may create a new instance.
    fn is_starting(message: &IntegrationMessage) -> bool;

    fn transition(
        state: Self::State,
        data: &Self::Data,
        message: &IntegrationMessage,
        now: DateTime<Utc>,
    ) -> Transition<Self::State, Self::Data>;
}

/// States reachable from the initial state along `EDGES`.
pub fn reachable_states<D: SagaDefinition>() -> Vec<D::State> {
    reachable_from::<D>(D::initial_state(), D::EDGES)
}

/// States reachable from `start` along `edges`.
pub fn reachable_from<D: SagaDefinition>(
    start: D::State,
    edges: &[(D::State, MessageKind, D::State)],
) -> Vec<D::State> {
    let mut seen = vec![start];
    let mut frontier = vec![start];
    while let Some(state) = frontier.pop() {
        for (from, _, to) in edges {
            if *from == state && !seen.contains(to) {
                seen.push(*to);
                frontier.push(*to);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use contracts::ReservationPaymentTimeoutMessage;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn outbound_becomes_correlated_outbox_row() {
        let id = CorrelationId::new();
        let at = Utc::now();
        let outbound = Outbound::new(ReservationPaymentTimeoutMessage {
            reservation_id: id.as_uuid(),
            expired_at: at,
        })
        .keyed(format!("reservation-timeout:{id}"))
        .deliver_after(at);

        let row = outbound.into_outbox(id).unwrap();
        assert_eq!(row.correlation_id, Some(id));
        assert_eq!(row.aggregate_id.map(|a| a.as_uuid()), Some(id.as_uuid()));
        assert_eq!(row.deliver_after, Some(at));
        assert_eq!(row.message_type, "ReservationPaymentTimeoutMessage");
    }

    #[test]
    fn emit_only_extends_advance() {
        let message = Outbound::new(ReservationPaymentTimeoutMessage {
            reservation_id: Uuid::nil(),
            expired_at: Utc::now(),
        });

        let ignored: Transition<u8, ()> = Transition::ignore("late").emit(message.clone());
        assert_eq!(ignored, Transition::ignore("late"));

        let advanced: Transition<u8, ()> = Transition::advance(1, ()).emit(message);
        assert!(matches!(advanced, Transition::Advance { outbound, .. } if outbound.len() == 1));
    }
}
