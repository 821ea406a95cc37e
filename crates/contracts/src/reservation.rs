//! Reservation ledger contracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Starts the reservation-payment process for a held reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReservationPaymentInitiatedMessage {
    pub reservation_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    /// End of the payment window; the hold is released after it.
    pub payment_expires_at: DateTime<Utc>,
}

/// Asks the reservation context to confirm a paid reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfirmReservationCommandMessage {
    pub reservation_id: Uuid,
    pub tracking_code: String,
    pub bill_id: Uuid,
    pub paid_amount_rials: i64,
    pub payment_reference: String,
}

/// Acknowledges that a reservation was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReservationConfirmedEventMessage {
    pub reservation_id: Uuid,
    pub tracking_code: String,
    pub confirmed_at: DateTime<Utc>,
}

/// Explicit business failure of the reservation payment (e.g. bill creation rejected).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReservationPaymentFailedMessage {
    pub reservation_id: Uuid,
    pub failure_stage: String,
    pub failure_reason: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Scheduled trigger delivered when the payment window elapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReservationPaymentTimeoutMessage {
    pub reservation_id: Uuid,
    pub expired_at: DateTime<Utc>,
}

/// Compensation: returns held capacity to the tour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseReservationCapacityCommandMessage {
    pub reservation_id: Uuid,
    pub tracking_code: String,
    pub reason: String,
}
