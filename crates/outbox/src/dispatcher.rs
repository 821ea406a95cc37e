//! Outbox dispatcher: publishes due rows and records the outcome.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{StreamExt, stream};
use message_store::{FailureOutcome, OutboxMessage, OutboxStore, RetryPolicy};
use tokio::sync::watch;

use crate::Result;
use crate::transport::Transport;

/// Tuning knobs for [`OutboxDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Rows fetched per pass.
    pub batch_size: usize,
    /// Sleep between passes once the outbox is drained.
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Rows of one batch published concurrently.
    pub publish_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            publish_concurrency: 8,
        }
    }
}

/// Tally of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub fetched: usize,
    pub published: usize,
    pub retried: usize,
    pub poisoned: usize,
    /// Rows whose outcome could not be recorded; they stay pending.
    pub errors: usize,
}

impl DispatchReport {
    /// True when every fetched row reached a recorded outcome.
    pub fn is_settled(&self) -> bool {
        self.errors == 0 && self.published + self.retried + self.poisoned == self.fetched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Published,
    Retried,
    Poisoned,
}

/// Publishes outbox rows through a transport.
///
/// Each row is handled independently: a failing row never blocks the rest
/// of its batch. A crash mid-batch leaves unmarked rows pending, so they are
/// published again on restart; consumers deduplicate.
pub struct OutboxDispatcher<S: OutboxStore, T: Transport> {
    store: S,
    transport: T,
    config: DispatcherConfig,
}

impl<S: OutboxStore, T: Transport> OutboxDispatcher<S, T> {
    pub fn new(store: S, transport: T, config: DispatcherConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one pass over the due rows.
    #[tracing::instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn dispatch_batch(&self) -> Result<DispatchReport> {
        let started = Instant::now();
        let batch = self
            .store
            .fetch_due(self.config.batch_size, Utc::now())
            .await?;

        let mut report = DispatchReport {
            fetched: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<_> = stream::iter(batch)
            .map(|message| self.deliver(message))
            .buffer_unordered(self.config.publish_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(Delivery::Published) => report.published += 1,
                Ok(Delivery::Retried) => report.retried += 1,
                Ok(Delivery::Poisoned) => report.poisoned += 1,
                Err(e) => {
                    tracing::error!(error = %e, "failed to record delivery outcome");
                    report.errors += 1;
                }
            }
        }

        metrics::histogram!("outbox_dispatch_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            fetched = report.fetched,
            published = report.published,
            retried = report.retried,
            poisoned = report.poisoned,
            "dispatch pass complete"
        );

        Ok(report)
    }

    async fn deliver(&self, mut message: OutboxMessage) -> Result<Delivery> {
        let envelope = message.to_envelope();

        if let Err(e) = envelope.decode() {
            message.poison("fails to deserialize", Utc::now());
            message.error = Some(e.to_string());
            self.store.save_delivery_failure(&message).await?;

            metrics::counter!("outbox_messages_poisoned_total").increment(1);
            tracing::error!(
                message_id = %message.id,
                message_type = %message.message_type,
                error = %e,
                "undecodable outbox message quarantined"
            );
            return Ok(Delivery::Poisoned);
        }

        match self.transport.publish(&envelope).await {
            Ok(()) => {
                if !self.store.mark_processed(message.id, Utc::now()).await? {
                    tracing::debug!(message_id = %message.id, "row already marked processed");
                }
                metrics::counter!("outbox_messages_published_total").increment(1);
                Ok(Delivery::Published)
            }
            Err(e) => {
                let outcome =
                    message.register_failure(e.to_string(), Utc::now(), &self.config.retry_policy);
                self.store.save_delivery_failure(&message).await?;

                match outcome {
                    FailureOutcome::Retry { next_retry_at } => {
                        metrics::counter!("outbox_messages_retried_total").increment(1);
                        tracing::warn!(
                            message_id = %message.id,
                            retry_count = message.retry_count,
                            %next_retry_at,
                            error = %e,
                            "publish failed, retry scheduled"
                        );
                        Ok(Delivery::Retried)
                    }
                    FailureOutcome::Poisoned => {
                        metrics::counter!("outbox_messages_poisoned_total").increment(1);
                        tracing::warn!(
                            message_id = %message.id,
                            message_type = %message.message_type,
                            retry_count = message.retry_count,
                            error = %e,
                            "publish retries exhausted, message poisoned"
                        );
                        Ok(Delivery::Poisoned)
                    }
                }
            }
        }
    }

    /// Dispatches until `shutdown` flips to true.
    ///
    /// Full, settled batches are drained back to back; otherwise the loop
    /// sleeps for `poll_interval`. A pass whose outcomes could not all be
    /// recorded always sleeps, since its rows are still due. Shutdown is
    /// observed between passes only.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox dispatcher started"
        );

        while !*shutdown.borrow() {
            match self.dispatch_batch().await {
                Ok(report)
                    if report.fetched == self.config.batch_size && report.is_settled() =>
                {
                    continue;
                }
                Ok(report) if report.errors > 0 => tracing::warn!(
                    errors = report.errors,
                    "delivery outcomes not recorded, backing off"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "outbox dispatch pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("outbox dispatcher stopped");
    }
}
