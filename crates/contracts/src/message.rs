//! The closed set of integration messages and their schema registry.

use crate::billing::{
    BillCancelledIntegrationEvent, BillCreatedIntegrationEvent, BillFullyPaidEventMessage,
    CancelBillCommandMessage, CreateBillCommandMessage, RefundCompletedIntegrationEvent,
};
use crate::error::{ContractError, Result};
use crate::reservation::{
    ConfirmReservationCommandMessage, ReleaseReservationCapacityCommandMessage,
    ReservationConfirmedEventMessage, ReservationPaymentFailedMessage,
    ReservationPaymentInitiatedMessage, ReservationPaymentTimeoutMessage,
};
use crate::wallet::{
    ChargeWalletCommandMessage, FailWalletDepositCommandMessage,
    MarkWalletDepositAwaitingPaymentCommandMessage, WalletChargeSucceededEventMessage,
    WalletDepositCompletedEventMessage, WalletDepositCompletionFailedMessage,
    WalletDepositFailedEventMessage, WalletDepositRequestedMessage,
};

/// Generates [`MessageKind`], [`IntegrationMessage`] and the registry tables
/// from a single list so the three can never drift apart.
macro_rules! integration_messages {
    ($( $variant:ident($ty:ident) in $module:literal at $version:literal; )+) => {
        /// Registry key of every known contract.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $( $variant, )+
        }

        /// A decoded integration message.
        #[derive(Debug, Clone, PartialEq)]
        pub enum IntegrationMessage {
            $( $variant($ty), )+
        }

        impl MessageKind {
            /// Every registered kind.
            pub const ALL: &'static [MessageKind] = &[ $( MessageKind::$variant, )+ ];

            /// Short type name stored in the outbox `message_type` column.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $( MessageKind::$variant => stringify!($ty), )+
                }
            }

            /// Name of the contract module that owns this message.
            pub fn assembly_name(&self) -> &'static str {
                match self {
                    $( MessageKind::$variant => $module, )+
                }
            }

            /// Module-qualified type name.
            pub fn full_type_name(&self) -> &'static str {
                match self {
                    $( MessageKind::$variant => concat!($module, "::", stringify!($ty)), )+
                }
            }

            /// Schema version written by this build.
            pub fn schema_version(&self) -> i32 {
                match self {
                    $( MessageKind::$variant => $version, )+
                }
            }

            /// Decodes a payload written with `version` of this kind's schema.
            ///
            /// Older versions are accepted as long as the fields added since
            /// default when absent; newer versions are rejected.
            pub fn decode(&self, version: i32, content: serde_json::Value) -> Result<IntegrationMessage> {
                let current = self.schema_version();
                let message_type = self.type_name();
                if version < 1 || version > current {
                    return Err(ContractError::UnsupportedSchemaVersion {
                        message_type,
                        version,
                        current,
                    });
                }

                match self {
                    $(
                        MessageKind::$variant => serde_json::from_value::<$ty>(content)
                            .map(IntegrationMessage::$variant)
                            .map_err(|source| ContractError::Payload { message_type, source }),
                    )+
                }
            }
        }

        impl IntegrationMessage {
            /// Returns the registry key of this message.
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( IntegrationMessage::$variant(_) => MessageKind::$variant, )+
                }
            }

            /// Serializes the inner contract to its JSON wire form.
            pub fn to_content(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
                match self {
                    $( IntegrationMessage::$variant(message) => serde_json::to_value(message), )+
                }
            }
        }

        $(
            impl From<$ty> for IntegrationMessage {
                fn from(message: $ty) -> Self {
                    IntegrationMessage::$variant(message)
                }
            }
        )+
    };
}

integration_messages! {
    BillCreated(BillCreatedIntegrationEvent) in "billing" at 2;
    BillFullyPaid(BillFullyPaidEventMessage) in "billing" at 2;
    BillCancelled(BillCancelledIntegrationEvent) in "billing" at 1;
    RefundCompleted(RefundCompletedIntegrationEvent) in "billing" at 1;
    CreateBill(CreateBillCommandMessage) in "billing" at 1;
    CancelBill(CancelBillCommandMessage) in "billing" at 1;
    ReservationPaymentInitiated(ReservationPaymentInitiatedMessage) in "reservation" at 1;
    ConfirmReservation(ConfirmReservationCommandMessage) in "reservation" at 1;
    ReservationConfirmed(ReservationConfirmedEventMessage) in "reservation" at 1;
    ReservationPaymentFailed(ReservationPaymentFailedMessage) in "reservation" at 1;
    ReservationPaymentTimeout(ReservationPaymentTimeoutMessage) in "reservation" at 1;
    ReleaseReservationCapacity(ReleaseReservationCapacityCommandMessage) in "reservation" at 1;
    WalletDepositRequested(WalletDepositRequestedMessage) in "wallet" at 1;
    MarkWalletDepositAwaitingPayment(MarkWalletDepositAwaitingPaymentCommandMessage) in "wallet" at 1;
    FailWalletDeposit(FailWalletDepositCommandMessage) in "wallet" at 1;
    ChargeWallet(ChargeWalletCommandMessage) in "wallet" at 1;
    WalletChargeSucceeded(WalletChargeSucceededEventMessage) in "wallet" at 1;
    WalletDepositCompleted(WalletDepositCompletedEventMessage) in "wallet" at 1;
    WalletDepositCompletionFailed(WalletDepositCompletionFailedMessage) in "wallet" at 1;
    WalletDepositFailed(WalletDepositFailedEventMessage) in "wallet" at 1;
}

impl MessageKind {
    /// Looks a kind up by its short type name.
    pub fn from_type_name(name: &str) -> Option<MessageKind> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.type_name() == name)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use uuid::Uuid;

    use super::*;
    use crate::billing::REFERENCE_TYPE_TOUR_RESERVATION;

    #[test]
    fn every_kind_resolves_from_its_type_name() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_type_name(kind.type_name()), Some(*kind));
        }
        assert_eq!(MessageKind::from_type_name("OrderShipped"), None);
    }

    #[test]
    fn full_type_names_are_unique_and_qualified() {
        let names: HashSet<_> = MessageKind::ALL.iter().map(|k| k.full_type_name()).collect();
        assert_eq!(names.len(), MessageKind::ALL.len());
        assert_eq!(
            MessageKind::BillFullyPaid.full_type_name(),
            "billing::BillFullyPaidEventMessage"
        );
        assert_eq!(MessageKind::ChargeWallet.assembly_name(), "wallet");
    }

    #[test]
    fn decode_accepts_older_schema_version() {
        // Version 1 of BillFullyPaid predates PaymentId.
        let content = serde_json::json!({
            "BillId": Uuid::nil(),
            "ReferenceId": Uuid::nil(),
            "ReferenceType": REFERENCE_TYPE_TOUR_RESERVATION,
            "PaidAmountRials": 250_000,
        });

        let message = MessageKind::BillFullyPaid.decode(1, content).unwrap();
        match message {
            IntegrationMessage::BillFullyPaid(paid) => {
                assert_eq!(paid.paid_amount_rials, 250_000);
                assert!(paid.payment_id.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_newer_schema_version() {
        let result = MessageKind::BillCancelled.decode(2, serde_json::json!({}));
        assert!(matches!(
            result,
            Err(ContractError::UnsupportedSchemaVersion {
                version: 2,
                current: 1,
                ..
            })
        ));
    }

    #[test]
    fn decode_reports_payload_mismatch() {
        let result = MessageKind::WalletChargeSucceeded.decode(1, serde_json::json!({"Nope": 1}));
        assert!(matches!(
            result,
            Err(ContractError::Payload {
                message_type: "WalletChargeSucceededEventMessage",
                ..
            })
        ));
    }

    #[test]
    fn content_decodes_back_to_the_same_message() {
        let message = IntegrationMessage::from(crate::BillCancelledIntegrationEvent {
            bill_id: Uuid::new_v4(),
            reference_id: Uuid::new_v4(),
            reference_type: REFERENCE_TYPE_TOUR_RESERVATION.to_string(),
        });

        let kind = message.kind();
        let decoded = kind
            .decode(kind.schema_version(), message.to_content().unwrap())
            .unwrap();
        assert_eq!(decoded, message);
    }
}
