//! Messaging worker.
//!
//! Wires one message store and one transport into three long-running loops:
//! - the outbox dispatcher, publishing committed rows
//! - the saga consumer, feeding received messages to the sagas
//! - housekeeping, reclaiming reservations of crashed deliveries and
//!   purging delivered outbox rows
//!
//! Every loop stops when the shutdown channel flips to `true`.
//!
//! Delivery guarantees hold only as far as the transport is durable: with
//! [`outbox::InMemoryTransport`], messages accepted by the channel and
//! pending redeliveries are lost on crash.

pub mod config;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use message_store::{IdempotencyLedger, MessageStore, OutboxStore};
use outbox::{MessageSource, OutboxDispatcher, Transport};
use saga::{ReservationPaymentSaga, SagaConsumer, SagaRuntime, WalletDepositSaga};
use tokio::sync::{Semaphore, watch};

pub use config::WorkerConfig;
pub use error::WorkerError;

/// A store and a transport assembled into a runnable worker.
pub struct Worker<S, T> {
    store: S,
    transport: T,
    config: WorkerConfig,
}

impl<S, T> Worker<S, T>
where
    S: MessageStore + Clone + 'static,
    T: Transport + MessageSource + Clone + 'static,
{
    pub fn new(store: S, transport: T, config: WorkerConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> OutboxDispatcher<S, T> {
        OutboxDispatcher::new(
            self.store.clone(),
            self.transport.clone(),
            self.config.dispatcher_config(),
        )
    }

    /// Consumer routing to both sagas.
    pub fn consumer(&self) -> SagaConsumer<S> {
        let max_retries = self.config.outbox_max_retries;
        SagaConsumer::new(self.store.clone())
            .with_saga(
                SagaRuntime::<ReservationPaymentSaga, _>::new(self.store.clone())
                    .with_outbox_max_retries(max_retries),
            )
            .with_saga(
                SagaRuntime::<WalletDepositSaga, _>::new(self.store.clone())
                    .with_outbox_max_retries(max_retries),
            )
            .with_max_conflict_retries(self.config.saga_max_conflict_retries)
    }

    /// Runs all loops until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            consumer_concurrency = self.config.consumer_concurrency,
            "worker started"
        );

        let dispatcher = self.dispatcher();
        let dispatch = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        let consume = tokio::spawn(consume(
            Arc::new(self.consumer()),
            self.transport.clone(),
            self.config.consumer_concurrency,
            self.config.outbox_retry_base,
            shutdown.clone(),
        ));

        let maintain = tokio::spawn(housekeeping(
            self.store.clone(),
            self.config.idempotency_stale_after,
            self.config.outbox_retention,
            shutdown,
        ));

        let (dispatch, consume, maintain) = tokio::join!(dispatch, consume, maintain);
        for result in [dispatch, consume, maintain] {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task aborted");
            }
        }

        tracing::info!("worker stopped");
    }
}

/// Receives envelopes and hands each to `consumer` in its own task, at most
/// `concurrency` at a time. Messages that need redelivery are negatively
/// acknowledged with `redelivery_delay`.
///
/// On shutdown, stops receiving and waits for in-flight messages.
pub async fn consume<L, M>(
    consumer: Arc<SagaConsumer<L>>,
    source: M,
    concurrency: usize,
    redelivery_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    L: IdempotencyLedger + 'static,
    M: MessageSource + Clone + 'static,
{
    let permits = concurrency.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
    let semaphore = Arc::new(Semaphore::new(permits));

    while !*shutdown.borrow() {
        let envelope = tokio::select! {
            received = source.receive() => match received {
                Some(envelope) => envelope,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let consumer = consumer.clone();
        let source = source.clone();
        tokio::spawn(async move {
            let report = consumer.handle(&envelope).await;
            if report.needs_redelivery() {
                metrics::counter!("consumer_redeliveries_total").increment(1);
                if let Err(e) = source.nack(envelope, redelivery_delay).await {
                    tracing::warn!(error = %e, "could not schedule redelivery");
                }
            }
            drop(permit);
        });
    }

    // Every permit back means no handler is still running.
    let _ = semaphore.acquire_many(permits as u32).await;
    tracing::info!("saga consumer stopped");
}

/// Periodic maintenance of the message tables:
/// - releases idempotency reservations older than `stale_after` that never
///   reached processed or failed
/// - purges outbox rows processed more than `retention` ago
pub async fn housekeeping<S>(
    store: S,
    stale_after: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: OutboxStore + IdempotencyLedger,
{
    let period = (stale_after / 4).max(Duration::from_secs(1));
    let (Ok(stale_after), Ok(retention)) =
        (TimeDelta::from_std(stale_after), TimeDelta::from_std(retention))
    else {
        tracing::error!(
            ?stale_after,
            ?retention,
            "housekeeping threshold out of range, disabled"
        );
        return;
    };

    while !*shutdown.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let now = Utc::now();
        if let Some(reserved_before) = now.checked_sub_signed(stale_after) {
            match store.reclaim_stale(reserved_before).await {
                Ok(0) => {}
                Ok(released) => {
                    metrics::counter!("idempotency_reservations_reclaimed_total")
                        .increment(released);
                    tracing::warn!(released, "reclaimed stale idempotency reservations");
                }
                Err(e) => tracing::error!(error = %e, "idempotency reclaim failed"),
            }
        }

        if let Some(processed_before) = now.checked_sub_signed(retention) {
            match store.purge_processed(processed_before).await {
                Ok(0) => {}
                Ok(purged) => {
                    metrics::counter!("outbox_messages_purged_total").increment(purged);
                    tracing::info!(purged, "purged processed outbox rows");
                }
                Err(e) => tracing::error!(error = %e, "outbox purge failed"),
            }
        }
    }

    tracing::info!("housekeeping stopped");
}
