//! Billing ledger contracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `ReferenceType` of bills issued for a tour reservation.
pub const REFERENCE_TYPE_TOUR_RESERVATION: &str = "TourReservation";

/// `ReferenceType` of bills issued for a wallet deposit.
pub const REFERENCE_TYPE_WALLET_DEPOSIT: &str = "WalletDeposit";

/// Published by billing once a bill exists for a business reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BillCreatedIntegrationEvent {
    pub bill_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bill_number: Option<String>,
}

/// Published by billing when the full bill amount has been collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BillFullyPaidEventMessage {
    pub bill_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    pub paid_amount_rials: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
}

/// Acknowledges that a bill was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BillCancelledIntegrationEvent {
    pub bill_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
}

/// Published by billing when a refund reached the payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RefundCompletedIntegrationEvent {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    pub refund_amount_rials: i64,
    pub requested_by_national_number: String,
    pub gateway_refund_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Asks billing to issue a bill for a business reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateBillCommandMessage {
    pub reference_id: Uuid,
    pub reference_type: String,
    pub reference_tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    pub description: String,
}

/// Compensation: asks billing to cancel an unpaid bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelBillCommandMessage {
    pub bill_id: Uuid,
    pub reference_id: Uuid,
    pub reference_type: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bill_fully_paid_uses_pascal_case_fields() {
        let event = BillFullyPaidEventMessage {
            bill_id: Uuid::nil(),
            reference_id: Uuid::nil(),
            reference_type: REFERENCE_TYPE_WALLET_DEPOSIT.to_string(),
            paid_amount_rials: 100_000,
            payment_id: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["PaidAmountRials"], 100_000);
        assert_eq!(json["ReferenceType"], "WalletDeposit");
        assert!(json.get("PaymentId").is_none());
    }

    #[test]
    fn bill_created_accepts_payload_without_bill_number() {
        let json = serde_json::json!({
            "BillId": Uuid::nil(),
            "ReferenceId": Uuid::nil(),
            "ReferenceType": "TourReservation",
        });

        let event: BillCreatedIntegrationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.reference_type, REFERENCE_TYPE_TOUR_RESERVATION);
        assert!(event.bill_number.is_none());
    }
}
