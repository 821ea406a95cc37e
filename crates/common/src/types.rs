use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is a distinct type so a message id can never be passed
/// where a correlation id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of the business entity that produced an event
    /// (a bill, a wallet deposit, a reservation).
    AggregateId
);

uuid_id!(
    /// Stable identifier tying every message of one saga instance together.
    ///
    /// Equals the business-process identifier: the reservation id for the
    /// reservation-payment saga, the wallet-deposit id for the wallet-deposit saga.
    CorrelationId
);

uuid_id!(
    /// Identifier of a single outbox row / transport message.
    MessageId
);

impl From<AggregateId> for CorrelationId {
    fn from(id: AggregateId) -> Self {
        Self(id.as_uuid())
    }
}

impl From<CorrelationId> for AggregateId {
    fn from(id: CorrelationId) -> Self {
        Self(id.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        assert_eq!(CorrelationId::from_uuid(uuid).as_uuid(), uuid);
        assert_eq!(AggregateId::from(uuid).as_uuid(), uuid);
    }

    #[test]
    fn correlation_and_aggregate_ids_share_the_uuid() {
        let aggregate = AggregateId::new();
        let correlation = CorrelationId::from(aggregate);
        assert_eq!(correlation.as_uuid(), aggregate.as_uuid());
        assert_eq!(AggregateId::from(correlation), aggregate);
    }

    #[test]
    fn serializes_as_bare_uuid() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
