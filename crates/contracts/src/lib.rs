//! Message contracts exchanged between the billing, wallet and reservation
//! bounded contexts and the saga layer.
//!
//! Every contract is a plain serde struct with PascalCase wire field names.
//! [`IntegrationMessage`] is the closed union of all of them and
//! [`MessageKind`] is the versioned schema registry used to turn a stored
//! `(type, version, content)` triple back into a typed message.

pub mod billing;
pub mod envelope;
pub mod error;
pub mod message;
pub mod reservation;
pub mod wallet;

pub use billing::{
    BillCancelledIntegrationEvent, BillCreatedIntegrationEvent, BillFullyPaidEventMessage,
    CancelBillCommandMessage, CreateBillCommandMessage, RefundCompletedIntegrationEvent,
    REFERENCE_TYPE_TOUR_RESERVATION, REFERENCE_TYPE_WALLET_DEPOSIT,
};
pub use envelope::MessageEnvelope;
pub use error::{ContractError, Result};
pub use message::{IntegrationMessage, MessageKind};
pub use reservation::{
    ConfirmReservationCommandMessage, ReleaseReservationCapacityCommandMessage,
    ReservationConfirmedEventMessage, ReservationPaymentFailedMessage,
    ReservationPaymentInitiatedMessage, ReservationPaymentTimeoutMessage,
};
pub use wallet::{
    ChargeWalletCommandMessage, FailWalletDepositCommandMessage,
    MarkWalletDepositAwaitingPaymentCommandMessage, WalletChargeSucceededEventMessage,
    WalletDepositCompletedEventMessage, WalletDepositCompletionFailedMessage,
    WalletDepositFailedEventMessage, WalletDepositRequestedMessage,
};
