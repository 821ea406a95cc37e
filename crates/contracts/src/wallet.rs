//! Wallet ledger contracts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value metadata carried along a wallet deposit.
pub type Metadata = BTreeMap<String, String>;

/// A user asked to top up their wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletDepositRequestedMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Links a wallet deposit to the bill the user has to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarkWalletDepositAwaitingPaymentCommandMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    pub bill_id: Uuid,
    pub bill_number: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Explicit failure of a wallet deposit raised by any participating context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailWalletDepositCommandMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub failure_stage: String,
    pub failure_reason: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub bill_id: Option<Uuid>,
    #[serde(default)]
    pub bill_number: Option<String>,
    #[serde(default)]
    pub payment_id: Option<Uuid>,
}

/// Asks the wallet ledger to credit the deposit amount.
///
/// `IdempotencyKey` is derived from the deposit id so the wallet ledger can
/// refuse a second credit for the same deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChargeWalletCommandMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub amount_rials: i64,
    pub currency: String,
    pub idempotency_key: String,
}

/// Acknowledges that the wallet was credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletChargeSucceededEventMessage {
    pub wallet_deposit_id: Uuid,
    pub transaction_id: Uuid,
    pub charged_at: DateTime<Utc>,
}

/// Published when a deposit has been credited end to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletDepositCompletedEventMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    pub bill_id: Uuid,
    pub bill_number: String,
    pub payment_id: Option<Uuid>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// The wallet ledger could not credit a paid deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletDepositCompletionFailedMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub bill_id: Uuid,
    pub bill_number: String,
    pub payment_id: Option<Uuid>,
    pub failure_reason: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Published once when a deposit reaches `Failed`, so the originating
/// context can reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalletDepositFailedEventMessage {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub failure_stage: String,
    pub failure_reason: String,
    pub error_code: Option<String>,
    pub bill_id: Option<Uuid>,
    pub bill_number: Option<String>,
    pub payment_id: Option<Uuid>,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_command_optional_fields_default_to_none() {
        let json = serde_json::json!({
            "WalletDepositId": Uuid::nil(),
            "TrackingCode": "WD-1",
            "FailureStage": "BillCreation",
            "FailureReason": "billing rejected the request",
        });

        let cmd: FailWalletDepositCommandMessage = serde_json::from_value(json).unwrap();
        assert_eq!(cmd.failure_stage, "BillCreation");
        assert!(cmd.error_code.is_none());
        assert!(cmd.bill_id.is_none());
        assert!(cmd.payment_id.is_none());
    }

    #[test]
    fn metadata_defaults_to_empty() {
        let json = serde_json::json!({
            "WalletDepositId": Uuid::nil(),
            "TrackingCode": "WD-1",
            "ExternalUserId": Uuid::nil(),
            "UserFullName": "Sara Karimi",
            "AmountRials": 100_000,
            "Currency": "IRR",
        });

        let msg: WalletDepositRequestedMessage = serde_json::from_value(json).unwrap();
        assert!(msg.metadata.is_empty());
    }
}
