//! Wallet-Deposit saga: credits a wallet once the deposit's bill is paid.
//!
//! ```text
//! Requested ──► AwaitingPayment ──► Completing ──► Completed
//!     │               │                 │
//!     └───────────────┴─────────────────┴──► Failed
//! ```

use chrono::{DateTime, Utc};
use common::CorrelationId;
use contracts::{
    ChargeWalletCommandMessage, IntegrationMessage, MessageKind, REFERENCE_TYPE_WALLET_DEPOSIT,
    WalletDepositCompletedEventMessage, WalletDepositFailedEventMessage, wallet::Metadata,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::{Outbound, SagaDefinition, SagaState, Transition};

pub const SAGA_TYPE: &str = "wallet_deposit";

/// Failure stage reported when the wallet ledger rejects the credit.
pub const STAGE_COMPLETION: &str = "Completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletDepositState {
    Requested,
    AwaitingPayment,
    Completing,
    Completed,
    Failed,
}

impl SagaState for WalletDepositState {
    const ALL: &'static [Self] = &[
        Self::Requested,
        Self::AwaitingPayment,
        Self::Completing,
        Self::Completed,
        Self::Failed,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "Requested",
            Self::AwaitingPayment => "AwaitingPayment",
            Self::Completing => "Completing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WalletDepositState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletDepositData {
    pub wallet_deposit_id: Uuid,
    pub tracking_code: String,
    pub external_user_id: Uuid,
    pub user_full_name: String,
    pub amount_rials: i64,
    pub currency: String,
    pub metadata: Metadata,

    pub bill_id: Option<Uuid>,
    pub bill_number: Option<String>,
    pub paid_amount_rials: Option<i64>,
    pub payment_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,

    pub failure_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub error_code: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl WalletDepositData {
    fn is_registered(&self) -> bool {
        !self.wallet_deposit_id.is_nil()
    }

    /// Key the wallet ledger uses to refuse a second credit.
    pub fn charge_key(wallet_deposit_id: Uuid) -> String {
        format!("wallet-deposit-charge:{wallet_deposit_id}")
    }

    fn failed(
        &self,
        stage: &str,
        reason: &str,
        error_code: Option<String>,
        now: DateTime<Utc>,
    ) -> (Self, Outbound) {
        let data = Self {
            failure_stage: Some(stage.to_string()),
            failure_reason: Some(reason.to_string()),
            error_code,
            failed_at: Some(now),
            ..self.clone()
        };
        let event = Outbound::new(WalletDepositFailedEventMessage {
            wallet_deposit_id: data.wallet_deposit_id,
            tracking_code: data.tracking_code.clone(),
            failure_stage: stage.to_string(),
            failure_reason: reason.to_string(),
            error_code: data.error_code.clone(),
            bill_id: data.bill_id,
            bill_number: data.bill_number.clone(),
            payment_id: data.payment_id,
            failed_at: now,
        })
        .keyed(format!("wallet-deposit-failed:{}", data.wallet_deposit_id));
        (data, event)
    }
}

/// Wallet-Deposit saga definition.
#[derive(Debug, Clone, Copy)]
pub struct WalletDepositSaga;

type State = WalletDepositState;
type Step = Transition<WalletDepositState, WalletDepositData>;

impl SagaDefinition for WalletDepositSaga {
    const SAGA_TYPE: &'static str = SAGA_TYPE;

    type State = WalletDepositState;
    type Data = WalletDepositData;

    const EDGES: &'static [(State, MessageKind, State)] = &[
        (State::Requested, MessageKind::WalletDepositRequested, State::Requested),
        (State::Requested, MessageKind::MarkWalletDepositAwaitingPayment, State::AwaitingPayment),
        (State::AwaitingPayment, MessageKind::BillFullyPaid, State::Completing),
        (State::Completing, MessageKind::WalletChargeSucceeded, State::Completed),
        (State::Completing, MessageKind::WalletDepositCompletionFailed, State::Failed),
        (State::Requested, MessageKind::FailWalletDeposit, State::Failed),
        (State::AwaitingPayment, MessageKind::FailWalletDeposit, State::Failed),
        (State::Completing, MessageKind::FailWalletDeposit, State::Failed),
    ];

    fn initial_state() -> State {
        State::Requested
    }

    fn correlate(message: &IntegrationMessage) -> Option<CorrelationId> {
        let id = match message {
            IntegrationMessage::WalletDepositRequested(m) => m.wallet_deposit_id,
            IntegrationMessage::MarkWalletDepositAwaitingPayment(m) => m.wallet_deposit_id,
            IntegrationMessage::FailWalletDeposit(m) => m.wallet_deposit_id,
            IntegrationMessage::WalletChargeSucceeded(m) => m.wallet_deposit_id,
            IntegrationMessage::WalletDepositCompletionFailed(m) => m.wallet_deposit_id,
            IntegrationMessage::BillFullyPaid(m)
                if m.reference_type == REFERENCE_TYPE_WALLET_DEPOSIT =>
            {
                m.reference_id
            }
            _ => return None,
        };
        Some(CorrelationId::from_uuid(id))
    }

    fn is_starting(message: &IntegrationMessage) -> bool {
        matches!(
            message,
            IntegrationMessage::WalletDepositRequested(_)
                | IntegrationMessage::MarkWalletDepositAwaitingPayment(_)
        )
    }

    fn transition(
        state: State,
        data: &WalletDepositData,
        message: &IntegrationMessage,
        now: DateTime<Utc>,
    ) -> Step {
        match (state, message) {
            (State::Requested, IntegrationMessage::WalletDepositRequested(m)) => {
                if data.is_registered() {
                    return Transition::ignore("deposit already registered");
                }
                let data = WalletDepositData {
                    wallet_deposit_id: m.wallet_deposit_id,
                    tracking_code: m.tracking_code.clone(),
                    external_user_id: m.external_user_id,
                    user_full_name: m.user_full_name.clone(),
                    amount_rials: m.amount_rials,
                    currency: m.currency.clone(),
                    metadata: m.metadata.clone(),
                    ..data.clone()
                };
                Transition::advance(State::Requested, data)
            }

            (State::Requested, IntegrationMessage::MarkWalletDepositAwaitingPayment(m)) => {
                let mut metadata = data.metadata.clone();
                metadata.extend(m.metadata.clone());
                let data = WalletDepositData {
                    wallet_deposit_id: m.wallet_deposit_id,
                    tracking_code: m.tracking_code.clone(),
                    external_user_id: m.external_user_id,
                    user_full_name: m.user_full_name.clone(),
                    amount_rials: m.amount_rials,
                    currency: m.currency.clone(),
                    metadata,
                    bill_id: Some(m.bill_id),
                    bill_number: Some(m.bill_number.clone()),
                    ..data.clone()
                };
                Transition::advance(State::AwaitingPayment, data)
            }

            (State::Requested, IntegrationMessage::BillFullyPaid(_)) => {
                Transition::defer("bill paid before it was linked to the deposit")
            }

            (State::AwaitingPayment, IntegrationMessage::BillFullyPaid(m)) => {
                if data.bill_id.is_some_and(|bill_id| bill_id != m.bill_id) {
                    return Transition::ignore(format!(
                        "payment for bill {} does not belong to this deposit",
                        m.bill_id
                    ));
                }

                let data = WalletDepositData {
                    paid_amount_rials: Some(m.paid_amount_rials),
                    payment_id: m.payment_id,
                    ..data.clone()
                };
                let key = WalletDepositData::charge_key(data.wallet_deposit_id);
                let charge = Outbound::new(ChargeWalletCommandMessage {
                    wallet_deposit_id: data.wallet_deposit_id,
                    tracking_code: data.tracking_code.clone(),
                    external_user_id: data.external_user_id,
                    amount_rials: data.amount_rials,
                    currency: data.currency.clone(),
                    idempotency_key: key.clone(),
                })
                .keyed(key);

                Transition::advance(State::Completing, data).emit(charge)
            }

            (State::Completing, IntegrationMessage::WalletChargeSucceeded(m)) => {
                let data = WalletDepositData {
                    transaction_id: Some(m.transaction_id),
                    completed_at: Some(m.charged_at),
                    ..data.clone()
                };
                let completed = Outbound::new(WalletDepositCompletedEventMessage {
                    wallet_deposit_id: data.wallet_deposit_id,
                    tracking_code: data.tracking_code.clone(),
                    external_user_id: data.external_user_id,
                    user_full_name: data.user_full_name.clone(),
                    amount_rials: data.amount_rials,
                    currency: data.currency.clone(),
                    bill_id: data.bill_id.unwrap_or_default(),
                    bill_number: data.bill_number.clone().unwrap_or_default(),
                    payment_id: data.payment_id,
                    completed_at: m.charged_at,
                    metadata: data.metadata.clone(),
                })
                .keyed(format!("wallet-deposit-completed:{}", data.wallet_deposit_id));

                Transition::advance(State::Completed, data).emit(completed)
            }

            (State::Completing, IntegrationMessage::WalletDepositCompletionFailed(m)) => {
                let (data, event) = data.failed(STAGE_COMPLETION, &m.failure_reason, None, now);
                Transition::advance(State::Failed, data).emit(event)
            }

            (
                State::Requested | State::AwaitingPayment | State::Completing,
                IntegrationMessage::FailWalletDeposit(m),
            ) => {
                let base = WalletDepositData {
                    wallet_deposit_id: m.wallet_deposit_id,
                    tracking_code: if data.tracking_code.is_empty() {
                        m.tracking_code.clone()
                    } else {
                        data.tracking_code.clone()
                    },
                    bill_id: data.bill_id.or(m.bill_id),
                    bill_number: data.bill_number.clone().or_else(|| m.bill_number.clone()),
                    payment_id: data.payment_id.or(m.payment_id),
                    ..data.clone()
                };
                let (data, event) =
                    base.failed(&m.failure_stage, &m.failure_reason, m.error_code.clone(), now);
                Transition::advance(State::Failed, data).emit(event)
            }

            (state, message) => {
                Transition::ignore(format!("{} not expected in {state}", message.kind()))
            }
        }
    }
}
