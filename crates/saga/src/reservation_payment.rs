//! Reservation-Payment saga: bills a tour reservation and confirms it once
//! the bill is fully paid, or releases the held capacity.
//!
//! ```text
//! Started ──► AwaitingBill ──► AwaitingPayment ──► Confirming ──► Completed
//!                  │                 │    │
//!                  └──► Failed ◄─────┘    └──► Cancelling ──► Cancelled
//! ```

use chrono::{DateTime, Utc};
use common::CorrelationId;
use contracts::{
    CancelBillCommandMessage, ConfirmReservationCommandMessage, CreateBillCommandMessage,
    IntegrationMessage, MessageKind, REFERENCE_TYPE_TOUR_RESERVATION,
    ReleaseReservationCapacityCommandMessage, ReservationPaymentTimeoutMessage,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::{Outbound, SagaDefinition, SagaState, Transition};

/// The saga type identifier.
pub const SAGA_TYPE: &str = "reservation_payment";

/// Failure stage reported when the payment window closes before a bill exists.
pub const STAGE_PAYMENT_TIMEOUT: &str = "PaymentTimeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationPaymentState {
    Started,
    AwaitingBill,
    AwaitingPayment,
    Confirming,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl SagaState for ReservationPaymentState {
    const ALL: &'static [Self] = &[
        Self::Started,
        Self::AwaitingBill,
        Self::AwaitingPayment,
        Self::Confirming,
        Self::Completed,
        Self::Failed,
        Self::Cancelling,
        Self::Cancelled,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::AwaitingBill => "AwaitingBill",
            Self::AwaitingPayment => "AwaitingPayment",
            Self::Confirming => "Confirming",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelling => "Cancelling",
            Self::Cancelled => "Cancelled",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ReservationPaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business snapshot persisted with the saga row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservationPaymentData {
    pub reservation_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    pub payment_expires_at: Option<DateTime<Utc>>,

    pub bill_id: Option<Uuid>,
    pub bill_number: Option<String>,
    pub paid_amount_rials: Option<i64>,
    pub payment_id: Option<Uuid>,
    pub refund_id: Option<Uuid>,

    pub failure_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub error_code: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl ReservationPaymentData {
    /// Key under which the bill for this reservation is requested.
    pub fn bill_key(reservation_id: Uuid) -> String {
        format!("reservation-bill:{reservation_id}")
    }

    fn release_capacity(&self, reason: &str) -> Outbound {
        Outbound::new(ReleaseReservationCapacityCommandMessage {
            reservation_id: self.reservation_id,
            tracking_code: self.tracking_code.clone(),
            reason: reason.to_string(),
        })
        .keyed(format!("reservation-release:{}", self.reservation_id))
    }

    fn cancel_bill(&self, reason: &str) -> Option<Outbound> {
        let bill_id = self.bill_id?;
        Some(
            Outbound::new(CancelBillCommandMessage {
                bill_id,
                reference_id: self.reservation_id,
                reference_type: REFERENCE_TYPE_TOUR_RESERVATION.to_string(),
                reason: reason.to_string(),
            })
            .keyed(format!("reservation-cancel-bill:{}", self.reservation_id)),
        )
    }

    fn payment_reference(&self, bill_id: Uuid) -> String {
        match (self.payment_id, &self.bill_number) {
            (Some(payment_id), _) => payment_id.to_string(),
            (None, Some(bill_number)) => bill_number.clone(),
            (None, None) => bill_id.to_string(),
        }
    }
}

/// Reservation-Payment saga definition.
#[derive(Debug, Clone, Copy)]
pub struct ReservationPaymentSaga;

type State = ReservationPaymentState;
type Step = Transition<ReservationPaymentState, ReservationPaymentData>;

fn is_tour_reservation(reference_type: &str) -> bool {
    reference_type == REFERENCE_TYPE_TOUR_RESERVATION
}

impl SagaDefinition for ReservationPaymentSaga {
    const SAGA_TYPE: &'static str = SAGA_TYPE;

    type State = ReservationPaymentState;
    type Data = ReservationPaymentData;

    const EDGES: &'static [(State, MessageKind, State)] = &[
        (State::Started, MessageKind::ReservationPaymentInitiated, State::AwaitingBill),
        (State::AwaitingBill, MessageKind::BillCreated, State::AwaitingPayment),
        (State::AwaitingPayment, MessageKind::BillFullyPaid, State::Confirming),
        (State::Confirming, MessageKind::ReservationConfirmed, State::Completed),
        (State::AwaitingBill, MessageKind::ReservationPaymentFailed, State::Failed),
        (State::AwaitingBill, MessageKind::ReservationPaymentTimeout, State::Failed),
        (State::AwaitingPayment, MessageKind::ReservationPaymentFailed, State::Failed),
        (State::AwaitingPayment, MessageKind::ReservationPaymentTimeout, State::Cancelling),
        (State::Cancelling, MessageKind::BillCancelled, State::Cancelled),
        (State::Cancelling, MessageKind::RefundCompleted, State::Cancelled),
    ];

    fn initial_state() -> State {
        State::Started
    }

    fn correlate(message: &IntegrationMessage) -> Option<CorrelationId> {
        let id = match message {
            IntegrationMessage::ReservationPaymentInitiated(m) => m.reservation_id,
            IntegrationMessage::ReservationConfirmed(m) => m.reservation_id,
            IntegrationMessage::ReservationPaymentFailed(m) => m.reservation_id,
            IntegrationMessage::ReservationPaymentTimeout(m) => m.reservation_id,
            IntegrationMessage::BillCreated(m) if is_tour_reservation(&m.reference_type) => {
                m.reference_id
            }
            IntegrationMessage::BillFullyPaid(m) if is_tour_reservation(&m.reference_type) => {
                m.reference_id
            }
            IntegrationMessage::BillCancelled(m) if is_tour_reservation(&m.reference_type) => {
                m.reference_id
            }
            IntegrationMessage::RefundCompleted(m) if is_tour_reservation(&m.reference_type) => {
                m.reference_id
            }
            _ => return None,
        };
        Some(CorrelationId::from_uuid(id))
    }

    fn is_starting(message: &IntegrationMessage) -> bool {
        matches!(message, IntegrationMessage::ReservationPaymentInitiated(_))
    }

    fn transition(
        state: State,
        data: &ReservationPaymentData,
        message: &IntegrationMessage,
        now: DateTime<Utc>,
    ) -> Step {
        match (state, message) {
            (State::Started, IntegrationMessage::ReservationPaymentInitiated(m)) => {
                let data = ReservationPaymentData {
                    reservation_id: m.reservation_id,
                    tracking_code: m.tracking_code.clone(),
                    external_user_id: m.external_user_id,
                    user_full_name: m.user_full_name.clone(),
                    amount_rials: m.amount_rials,
                    currency: m.currency.clone(),
                    payment_expires_at: Some(m.payment_expires_at),
                    ..Default::default()
                };

                let create_bill = Outbound::new(CreateBillCommandMessage {
                    reference_id: m.reservation_id,
                    reference_type: REFERENCE_TYPE_TOUR_RESERVATION.to_string(),
                    reference_tracking_code: m.tracking_code.clone(),
                    external_user_id: m.external_user_id,
                    user_full_name: m.user_full_name.clone(),
                    amount_rials: m.amount_rials,
                    currency: m.currency.clone(),
                    description: format!("Tour reservation {}", m.tracking_code),
                })
                .keyed(ReservationPaymentData::bill_key(m.reservation_id));

                let timeout = Outbound::new(ReservationPaymentTimeoutMessage {
                    reservation_id: m.reservation_id,
                    expired_at: m.payment_expires_at,
                })
                .keyed(format!("reservation-timeout:{}", m.reservation_id))
                .deliver_after(m.payment_expires_at);

                Transition::advance(State::AwaitingBill, data)
                    .emit(create_bill)
                    .emit(timeout)
            }

            (State::AwaitingBill, IntegrationMessage::BillCreated(m)) => {
                let data = ReservationPaymentData {
                    bill_id: Some(m.bill_id),
                    bill_number: m.bill_number.clone(),
                    ..data.clone()
                };
                Transition::advance(State::AwaitingPayment, data)
            }

            (State::AwaitingBill, IntegrationMessage::BillFullyPaid(_)) => {
                Transition::defer("bill payment arrived before the bill was linked")
            }

            (State::AwaitingPayment, IntegrationMessage::BillFullyPaid(m)) => {
                if let Some(bill_id) = data.bill_id
                    && bill_id != m.bill_id
                {
                    return Transition::ignore(format!(
                        "payment for bill {} does not match bill {bill_id}",
                        m.bill_id
                    ));
                }

                let data = ReservationPaymentData {
                    bill_id: Some(m.bill_id),
                    paid_amount_rials: Some(m.paid_amount_rials),
                    payment_id: m.payment_id,
                    ..data.clone()
                };
                let confirm = Outbound::new(ConfirmReservationCommandMessage {
                    reservation_id: data.reservation_id,
                    tracking_code: data.tracking_code.clone(),
                    bill_id: m.bill_id,
                    paid_amount_rials: m.paid_amount_rials,
                    payment_reference: data.payment_reference(m.bill_id),
                })
                .keyed(format!("reservation-confirm:{}", data.reservation_id));

                Transition::advance(State::Confirming, data).emit(confirm)
            }

            (State::Confirming, IntegrationMessage::ReservationConfirmed(m)) => {
                let data = ReservationPaymentData {
                    completed_at: Some(m.confirmed_at),
                    ..data.clone()
                };
                Transition::advance(State::Completed, data)
            }

            (State::AwaitingBill, IntegrationMessage::ReservationPaymentFailed(m)) => {
                let data = ReservationPaymentData {
                    failure_stage: Some(m.failure_stage.clone()),
                    failure_reason: Some(m.failure_reason.clone()),
                    error_code: m.error_code.clone(),
                    ..data.clone()
                };
                let release = data.release_capacity(&m.failure_reason);
                Transition::advance(State::Failed, data).emit(release)
            }

            (State::AwaitingBill, IntegrationMessage::ReservationPaymentTimeout(m)) => {
                let reason = format!("payment window expired at {}", m.expired_at);
                let data = ReservationPaymentData {
                    failure_stage: Some(STAGE_PAYMENT_TIMEOUT.to_string()),
                    failure_reason: Some(reason.clone()),
                    ..data.clone()
                };
                let release = data.release_capacity(&reason);
                Transition::advance(State::Failed, data).emit(release)
            }

            (State::AwaitingPayment, IntegrationMessage::ReservationPaymentFailed(m)) => {
                let data = ReservationPaymentData {
                    failure_stage: Some(m.failure_stage.clone()),
                    failure_reason: Some(m.failure_reason.clone()),
                    error_code: m.error_code.clone(),
                    ..data.clone()
                };
                let mut step = Transition::advance(State::Failed, data.clone());
                if let Some(cancel) = data.cancel_bill(&m.failure_reason) {
                    step = step.emit(cancel);
                }
                step.emit(data.release_capacity(&m.failure_reason))
            }

            (State::AwaitingPayment, IntegrationMessage::ReservationPaymentTimeout(m)) => {
                let reason = format!("payment window expired at {}", m.expired_at);
                let mut step = Transition::advance(State::Cancelling, data.clone());
                if let Some(cancel) = data.cancel_bill(&reason) {
                    step = step.emit(cancel);
                }
                step.emit(data.release_capacity(&reason))
            }

            (State::Cancelling, IntegrationMessage::BillCancelled(_)) => {
                let data = ReservationPaymentData {
                    completed_at: Some(now),
                    ..data.clone()
                };
                Transition::advance(State::Cancelled, data)
            }

            (State::Cancelling, IntegrationMessage::RefundCompleted(m)) => {
                let data = ReservationPaymentData {
                    refund_id: Some(m.refund_id),
                    completed_at: Some(m.completed_at),
                    ..data.clone()
                };
                Transition::advance(State::Cancelled, data)
            }

            (state, message) => {
                Transition::ignore(format!("{} not expected in {state}", message.kind()))
            }
        }
    }
}
