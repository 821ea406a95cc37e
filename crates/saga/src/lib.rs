//! Saga orchestration on top of the message store.
//!
//! A saga is a [`SagaDefinition`]: a pure state machine with a static edge
//! table. [`SagaRuntime`] loads an instance, runs the transition and commits
//! the new state, the outbound messages and the consumer's idempotency mark
//! in one atomic unit. [`SagaConsumer`] sits in front of the runtimes and
//! turns at-least-once delivery into exactly-once effects per saga.
//!
//! Two sagas are provided:
//! - [`ReservationPaymentSaga`]: bill a tour reservation, confirm it once
//!   paid, release its capacity otherwise
//! - [`WalletDepositSaga`]: credit a wallet once the deposit's bill is paid

pub mod consumer;
pub mod error;
pub mod machine;
pub mod reservation_payment;
pub mod runtime;
pub mod wallet_deposit;

pub use consumer::{
    ConsumeReport, DEFAULT_MAX_CONFLICT_RETRIES, DeliveryOutcome, SagaConsumer, SagaDelivery,
    SagaHandler,
};
pub use error::{Result, SagaError};
pub use machine::{
    Outbound, SagaDefinition, SagaState, Transition, reachable_from, reachable_states,
};
pub use reservation_payment::{
    ReservationPaymentData, ReservationPaymentSaga, ReservationPaymentState,
};
pub use runtime::{ApplyOutcome, SagaInstance, SagaRuntime};
pub use wallet_deposit::{WalletDepositData, WalletDepositSaga, WalletDepositState};
