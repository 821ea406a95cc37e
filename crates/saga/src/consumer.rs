//! Routes transport envelopes to sagas exactly once per saga.

use async_trait::async_trait;
use common::{AggregateId, CorrelationId};
use contracts::{IntegrationMessage, MessageEnvelope};
use message_store::{BeginOutcome, IdempotencyLedger, SagaStateStore};

use crate::error::{Result, SagaError};
use crate::machine::SagaDefinition;
use crate::runtime::{ApplyOutcome, SagaRuntime};

/// Default number of reload-and-retry attempts after a version conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Object-safe view of a [`SagaRuntime`], so runtimes of different saga
/// types can share one consumer.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    fn saga_type(&self) -> &'static str;

    fn correlate(&self, message: &IntegrationMessage) -> Option<CorrelationId>;

    async fn apply(
        &self,
        correlation_id: CorrelationId,
        message: &IntegrationMessage,
        idempotency_key: Option<&str>,
    ) -> Result<ApplyOutcome>;
}

#[async_trait]
impl<D: SagaDefinition, S: SagaStateStore> SagaHandler for SagaRuntime<D, S> {
    fn saga_type(&self) -> &'static str {
        D::SAGA_TYPE
    }

    fn correlate(&self, message: &IntegrationMessage) -> Option<CorrelationId> {
        D::correlate(message)
    }

    async fn apply(
        &self,
        correlation_id: CorrelationId,
        message: &IntegrationMessage,
        idempotency_key: Option<&str>,
    ) -> Result<ApplyOutcome> {
        SagaRuntime::apply(self, correlation_id, message, idempotency_key).await
    }
}

/// What happened to one envelope in one saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The saga runtime ran; see the inner outcome.
    Saga(ApplyOutcome),
    /// This saga already processed the message.
    Duplicate,
    /// Another delivery of the message is being processed.
    InFlight,
    /// Processing failed permanently; the ledger records the error.
    Failed { error: String },
    /// Processing failed transiently; the message should be redelivered.
    Retry { error: String },
}

impl DeliveryOutcome {
    pub fn needs_redelivery(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Saga(ApplyOutcome::Deferred { .. })
                | DeliveryOutcome::InFlight
                | DeliveryOutcome::Retry { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDelivery {
    pub saga_type: &'static str,
    pub correlation_id: CorrelationId,
    pub outcome: DeliveryOutcome,
}

/// Result of handling one envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Set when the envelope could not be decoded.
    pub rejected: Option<String>,
    /// One entry per saga the message correlated with.
    pub deliveries: Vec<SagaDelivery>,
}

impl ConsumeReport {
    fn rejected(reason: String) -> Self {
        Self {
            rejected: Some(reason),
            deliveries: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected.is_some()
    }

    /// True if any saga asked for the message again.
    pub fn needs_redelivery(&self) -> bool {
        self.deliveries.iter().any(|d| d.outcome.needs_redelivery())
    }

    pub fn applied(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|d| matches!(&d.outcome, DeliveryOutcome::Saga(o) if o.is_applied()))
            .count()
    }
}

/// Idempotent consumer in front of every registered saga.
///
/// Each saga reserves its own ledger key, `"{saga_type}:{dedup key}"`, so a
/// message consumed by two sagas is tracked separately for each.
pub struct SagaConsumer<L: IdempotencyLedger> {
    ledger: L,
    handlers: Vec<Box<dyn SagaHandler>>,
    max_conflict_retries: u32,
}

impl<L: IdempotencyLedger> SagaConsumer<L> {
    pub fn new(ledger: L) -> Self {
        Self {
            ledger,
            handlers: Vec::new(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_saga(mut self, handler: impl SagaHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(message_id = %envelope.message_id, message_type = %envelope.message_type)
    )]
    pub async fn handle(&self, envelope: &MessageEnvelope) -> ConsumeReport {
        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("consumer_messages_rejected_total").increment(1);
                tracing::error!(error = %e, "rejected undecodable message");
                return ConsumeReport::rejected(e.to_string());
            }
        };

        let dedup_key = envelope.deduplication_key();
        let mut report = ConsumeReport::default();

        for handler in &self.handlers {
            let Some(correlation_id) = handler.correlate(&message) else {
                continue;
            };
            let key = format!("{}:{dedup_key}", handler.saga_type());
            let outcome = self
                .deliver(handler.as_ref(), correlation_id, &message, &key)
                .await;
            report.deliveries.push(SagaDelivery {
                saga_type: handler.saga_type(),
                correlation_id,
                outcome,
            });
        }

        if report.deliveries.is_empty() {
            tracing::debug!("no saga consumes this message");
        }
        report
    }

    async fn deliver(
        &self,
        handler: &dyn SagaHandler,
        correlation_id: CorrelationId,
        message: &IntegrationMessage,
        key: &str,
    ) -> DeliveryOutcome {
        let aggregate_id = AggregateId::from(correlation_id);
        let begin = match self.ledger.try_begin(key, Some(aggregate_id)).await {
            Ok(begin) => begin,
            Err(e) => {
                tracing::warn!(key, error = %e, "idempotency ledger unavailable");
                return DeliveryOutcome::Retry {
                    error: e.to_string(),
                };
            }
        };

        match begin {
            BeginOutcome::Proceed => {}
            BeginOutcome::AlreadyProcessed => {
                metrics::counter!("consumer_duplicates_total", "saga_type" => handler.saga_type())
                    .increment(1);
                tracing::debug!(key, "duplicate delivery skipped");
                return DeliveryOutcome::Duplicate;
            }
            BeginOutcome::InFlight => {
                return match self.ledger.get_record(key).await {
                    Ok(Some(record)) if record.is_failed() => DeliveryOutcome::Failed {
                        error: record.error.unwrap_or_default(),
                    },
                    _ => DeliveryOutcome::InFlight,
                };
            }
        }

        match self.apply_with_retries(handler, correlation_id, message, key).await {
            Ok(outcome @ ApplyOutcome::Applied { .. }) => DeliveryOutcome::Saga(outcome),
            Ok(outcome @ (ApplyOutcome::Ignored { .. } | ApplyOutcome::Dropped { .. })) => {
                match self.ledger.mark_processed(key).await {
                    Ok(()) => DeliveryOutcome::Saga(outcome),
                    Err(e) => {
                        tracing::warn!(key, error = %e, "could not mark message processed");
                        self.release(key).await;
                        DeliveryOutcome::Retry {
                            error: e.to_string(),
                        }
                    }
                }
            }
            Ok(outcome @ ApplyOutcome::Deferred { .. }) => {
                self.release(key).await;
                DeliveryOutcome::Saga(outcome)
            }
            // Housekeeping reclaimed the reservation mid-delivery; it may
            // already be held by a redelivery, so it is not ours to release.
            Err(e) if e.is_lost_reservation() => {
                tracing::warn!(
                    key,
                    error = %e,
                    "reservation lost before commit, awaiting redelivery"
                );
                DeliveryOutcome::Retry {
                    error: e.to_string(),
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(key, error = %e, "saga delivery will be retried");
                self.release(key).await;
                DeliveryOutcome::Retry {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(key, %error, "saga delivery failed");
                if let Err(e) = self.ledger.mark_failed(key, &error).await {
                    tracing::warn!(key, error = %e, "could not record failure");
                }
                DeliveryOutcome::Failed { error }
            }
        }
    }

    async fn apply_with_retries(
        &self,
        handler: &dyn SagaHandler,
        correlation_id: CorrelationId,
        message: &IntegrationMessage,
        key: &str,
    ) -> Result<ApplyOutcome> {
        let mut attempt = 0;
        loop {
            match handler.apply(correlation_id, message, Some(key)).await {
                Err(SagaError::ConcurrencyConflict { .. }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    metrics::counter!(
                        "saga_concurrency_conflicts_total",
                        "saga_type" => handler.saga_type()
                    )
                    .increment(1);
                    tracing::warn!(%correlation_id, attempt, "version conflict, reloading saga");
                }
                result => return result,
            }
        }
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.ledger.release(key).await {
            tracing::warn!(key, error = %e, "could not release idempotency key");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};
    use contracts::{
        BillFullyPaidEventMessage, CreateBillCommandMessage,
        MarkWalletDepositAwaitingPaymentCommandMessage, REFERENCE_TYPE_WALLET_DEPOSIT,
        WalletChargeSucceededEventMessage, WalletDepositRequestedMessage,
    };
    use message_store::{
        EventIdempotency, InMemoryMessageStore, SagaCommit, SagaRecord, StoreError, Version,
    };
    use uuid::Uuid;

    use super::*;
    use crate::wallet_deposit::{WalletDepositSaga, WalletDepositState};

    fn consumer(store: &InMemoryMessageStore) -> SagaConsumer<InMemoryMessageStore> {
        SagaConsumer::new(store.clone())
            .with_saga(SagaRuntime::<WalletDepositSaga, _>::new(store.clone()))
    }

    fn envelope(message: impl Into<IntegrationMessage>) -> MessageEnvelope {
        MessageEnvelope::wrap(&message.into()).unwrap()
    }

    fn requested(id: Uuid) -> MessageEnvelope {
        envelope(WalletDepositRequestedMessage {
            wallet_deposit_id: id,
            tracking_code: "WD-1".to_string(),
            external_user_id: Uuid::new_v4(),
            user_full_name: "Sara Karimi".to_string(),
            amount_rials: 500_000,
            currency: "IRR".to_string(),
            metadata: Default::default(),
        })
    }

    fn mark(id: Uuid, bill_id: Uuid) -> MessageEnvelope {
        envelope(MarkWalletDepositAwaitingPaymentCommandMessage {
            wallet_deposit_id: id,
            tracking_code: "WD-1".to_string(),
            external_user_id: Uuid::new_v4(),
            user_full_name: "Sara Karimi".to_string(),
            amount_rials: 500_000,
            currency: "IRR".to_string(),
            bill_id,
            bill_number: "B-1".to_string(),
            metadata: Default::default(),
        })
    }

    fn paid(id: Uuid, bill_id: Uuid) -> MessageEnvelope {
        envelope(BillFullyPaidEventMessage {
            bill_id,
            reference_id: id,
            reference_type: REFERENCE_TYPE_WALLET_DEPOSIT.to_string(),
            paid_amount_rials: 500_000,
            payment_id: None,
        })
    }

    #[tokio::test]
    async fn redelivered_message_is_a_duplicate() {
        let store = InMemoryMessageStore::new();
        let consumer = consumer(&store);
        let id = Uuid::new_v4();
        let envelope = requested(id);

        let first = consumer.handle(&envelope).await;
        assert_eq!(first.applied(), 1);

        let second = consumer.handle(&envelope).await;
        assert_eq!(second.deliveries[0].outcome, DeliveryOutcome::Duplicate);
        assert!(!second.needs_redelivery());

        let key = format!("wallet_deposit:{}", envelope.message_id);
        let record = store.get_record(&key).await.unwrap().unwrap();
        assert!(record.is_processed);
    }

    #[tokio::test]
    async fn undecodable_envelope_is_rejected() {
        let consumer = consumer(&InMemoryMessageStore::new());
        let mut envelope = requested(Uuid::new_v4());
        envelope.content = serde_json::json!({ "TrackingCode": 7 });

        let report = consumer.handle(&envelope).await;
        assert!(report.is_rejected());
        assert!(report.deliveries.is_empty());
    }

    #[tokio::test]
    async fn deferred_message_releases_its_key() {
        let store = InMemoryMessageStore::new();
        let consumer = consumer(&store);
        let id = Uuid::new_v4();
        let bill_id = Uuid::new_v4();
        let early_payment = paid(id, bill_id);

        consumer.handle(&requested(id)).await;
        let report = consumer.handle(&early_payment).await;
        assert!(report.needs_redelivery());
        let key = format!("wallet_deposit:{}", early_payment.message_id);
        assert!(store.get_record(&key).await.unwrap().is_none());

        consumer.handle(&mark(id, bill_id)).await;
        let report = consumer.handle(&early_payment).await;
        assert_eq!(report.applied(), 1);

        let runtime = SagaRuntime::<WalletDepositSaga, _>::new(store.clone());
        let saga = runtime.load(id.into()).await.unwrap().unwrap();
        assert_eq!(saga.state, WalletDepositState::Completing);
    }

    #[tokio::test]
    async fn ignored_and_dropped_messages_are_marked_processed() {
        let store = InMemoryMessageStore::new();
        let consumer = consumer(&store);
        let orphan = envelope(WalletChargeSucceededEventMessage {
            wallet_deposit_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            charged_at: Utc::now(),
        });

        let report = consumer.handle(&orphan).await;
        assert!(matches!(
            report.deliveries[0].outcome,
            DeliveryOutcome::Saga(ApplyOutcome::Dropped { .. })
        ));
        let key = format!("wallet_deposit:{}", orphan.message_id);
        assert!(store.get_record(&key).await.unwrap().unwrap().is_processed);
    }

    #[tokio::test]
    async fn uncorrelated_message_touches_nothing() {
        let store = InMemoryMessageStore::new();
        let consumer = consumer(&store);
        let report = consumer
            .handle(&envelope(CreateBillCommandMessage {
                reference_id: Uuid::new_v4(),
                reference_type: REFERENCE_TYPE_WALLET_DEPOSIT.to_string(),
                reference_tracking_code: "WD-1".to_string(),
                external_user_id: Uuid::new_v4(),
                user_full_name: "Sara Karimi".to_string(),
                amount_rials: 1,
                currency: "IRR".to_string(),
                description: "deposit".to_string(),
            }))
            .await;

        assert!(report.deliveries.is_empty());
        assert!(!report.needs_redelivery());
    }

    #[tokio::test]
    async fn producer_key_takes_precedence_over_message_id() {
        let store = InMemoryMessageStore::new();
        let consumer = consumer(&store);
        let id = Uuid::new_v4();

        let mut first = requested(id);
        first.idempotency_key = Some(format!("deposit-requested:{id}"));
        let mut republished = requested(id);
        republished.idempotency_key = first.idempotency_key.clone();

        assert_eq!(consumer.handle(&first).await.applied(), 1);
        let report = consumer.handle(&republished).await;
        assert_eq!(report.deliveries[0].outcome, DeliveryOutcome::Duplicate);
    }

    /// Saga store whose commits race with stale-reservation housekeeping.
    struct ReclaimedBeforeCommit {
        inner: InMemoryMessageStore,
    }

    #[async_trait]
    impl SagaStateStore for ReclaimedBeforeCommit {
        async fn load_saga(
            &self,
            saga_type: &'static str,
            correlation_id: CorrelationId,
        ) -> message_store::Result<Option<SagaRecord>> {
            self.inner.load_saga(saga_type, correlation_id).await
        }

        async fn commit_saga(&self, commit: SagaCommit) -> message_store::Result<Version> {
            self.inner
                .reclaim_stale(Utc::now() + TimeDelta::seconds(1))
                .await?;
            self.inner.commit_saga(commit).await
        }

        async fn find_sagas(
            &self,
            saga_type: &'static str,
            state: &str,
        ) -> message_store::Result<Vec<SagaRecord>> {
            self.inner.find_sagas(saga_type, state).await
        }
    }

    /// Ledger that cannot record a processed mark.
    struct UnmarkableLedger {
        inner: InMemoryMessageStore,
    }

    #[async_trait]
    impl IdempotencyLedger for UnmarkableLedger {
        async fn try_begin(
            &self,
            key: &str,
            aggregate_id: Option<AggregateId>,
        ) -> message_store::Result<BeginOutcome> {
            self.inner.try_begin(key, aggregate_id).await
        }

        async fn mark_processed(&self, _key: &str) -> message_store::Result<()> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn mark_failed(&self, key: &str, error: &str) -> message_store::Result<()> {
            self.inner.mark_failed(key, error).await
        }

        async fn release(&self, key: &str) -> message_store::Result<()> {
            self.inner.release(key).await
        }

        async fn get_record(&self, key: &str) -> message_store::Result<Option<EventIdempotency>> {
            self.inner.get_record(key).await
        }

        async fn reclaim_stale(&self, reserved_before: DateTime<Utc>) -> message_store::Result<u64> {
            self.inner.reclaim_stale(reserved_before).await
        }
    }

    #[tokio::test]
    async fn reclaimed_reservation_is_redelivered_not_failed() {
        let store = InMemoryMessageStore::new();
        let racing = SagaConsumer::new(store.clone()).with_saga(
            SagaRuntime::<WalletDepositSaga, _>::new(ReclaimedBeforeCommit {
                inner: store.clone(),
            }),
        );
        let id = Uuid::new_v4();
        let envelope = mark(id, Uuid::new_v4());

        let report = racing.handle(&envelope).await;
        assert!(report.needs_redelivery());
        assert!(matches!(
            report.deliveries[0].outcome,
            DeliveryOutcome::Retry { .. }
        ));
        let key = format!("wallet_deposit:{}", envelope.message_id);
        assert!(store.get_record(&key).await.unwrap().is_none());

        // The redelivery reserves the key again and lands.
        let report = consumer(&store).handle(&envelope).await;
        assert_eq!(report.applied(), 1);
        let runtime = SagaRuntime::<WalletDepositSaga, _>::new(store.clone());
        let saga = runtime.load(id.into()).await.unwrap().unwrap();
        assert_eq!(saga.state, WalletDepositState::AwaitingPayment);
    }

    #[tokio::test]
    async fn unrecorded_processed_mark_releases_the_key() {
        let store = InMemoryMessageStore::new();
        let consumer = SagaConsumer::new(UnmarkableLedger {
            inner: store.clone(),
        })
        .with_saga(SagaRuntime::<WalletDepositSaga, _>::new(store.clone()));
        let orphan = envelope(WalletChargeSucceededEventMessage {
            wallet_deposit_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            charged_at: Utc::now(),
        });

        let report = consumer.handle(&orphan).await;
        assert!(report.needs_redelivery());
        assert!(matches!(
            report.deliveries[0].outcome,
            DeliveryOutcome::Retry { .. }
        ));

        // Redelivery starts afresh instead of reading InFlight.
        let key = format!("wallet_deposit:{}", orphan.message_id);
        assert!(store.get_record(&key).await.unwrap().is_none());
    }
}
