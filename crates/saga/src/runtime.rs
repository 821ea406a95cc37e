//! Persists saga transitions with optimistic concurrency.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use common::CorrelationId;
use contracts::IntegrationMessage;
use message_store::outbox::DEFAULT_MAX_RETRIES;
use message_store::{SagaCommit, SagaRecord, SagaStateStore, Version};

use crate::error::{Result, SagaError};
use crate::machine::{SagaDefinition, SagaState, Transition};

/// A typed saga instance as last persisted.
#[derive(Debug, Clone)]
pub struct SagaInstance<D: SagaDefinition> {
    pub correlation_id: CorrelationId,
    pub state: D::State,
    pub data: D::Data,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<D: SagaDefinition> SagaInstance<D> {
    fn from_record(record: SagaRecord) -> Result<Self> {
        let state = D::State::parse(&record.current_state).ok_or_else(|| {
            SagaError::CorruptState {
                saga_type: D::SAGA_TYPE,
                correlation_id: record.correlation_id,
                reason: format!("unknown state '{}'", record.current_state),
            }
        })?;
        let data = serde_json::from_value(record.snapshot).map_err(|e| SagaError::CorruptState {
            saga_type: D::SAGA_TYPE,
            correlation_id: record.correlation_id,
            reason: format!("unreadable snapshot: {e}"),
        })?;

        Ok(Self {
            correlation_id: record.correlation_id,
            state,
            data,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// What applying one trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transition was committed.
    Applied {
        from: &'static str,
        to: &'static str,
        version: Version,
        outbound: usize,
    },
    /// Terminal state or out-of-order trigger; nothing was written.
    Ignored { state: &'static str, reason: String },
    /// Prerequisite missing; nothing was written and the trigger should be
    /// redelivered later.
    Deferred { state: &'static str, reason: String },
    /// No instance exists and the trigger cannot start one.
    Dropped { reason: String },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Loads, transitions and commits instances of one saga type.
pub struct SagaRuntime<D: SagaDefinition, S: SagaStateStore> {
    store: S,
    outbox_max_retries: i32,
    _definition: PhantomData<fn() -> D>,
}

impl<D: SagaDefinition, S: SagaStateStore> SagaRuntime<D, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            outbox_max_retries: DEFAULT_MAX_RETRIES,
            _definition: PhantomData,
        }
    }

    /// Publish attempts granted to each outbound row before it is poisoned.
    pub fn with_outbox_max_retries(mut self, max_retries: i32) -> Self {
        self.outbox_max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the typed instance, if one exists.
    pub async fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>> {
        self.store
            .load_saga(D::SAGA_TYPE, correlation_id)
            .await?
            .map(SagaInstance::from_record)
            .transpose()
    }

    /// Instances currently in `state`.
    pub async fn find_in_state(&self, state: D::State) -> Result<Vec<SagaInstance<D>>> {
        self.store
            .find_sagas(D::SAGA_TYPE, state.as_str())
            .await?
            .into_iter()
            .map(SagaInstance::from_record)
            .collect()
    }

    /// Applies `message` to the instance `correlation_id`.
    ///
    /// The new state, the outbound messages and, when given, the processed
    /// mark of `idempotency_key` are committed together; on a stale version
    /// nothing is written and [`SagaError::ConcurrencyConflict`] is returned.
    #[tracing::instrument(
        skip(self, message, idempotency_key),
        fields(saga_type = D::SAGA_TYPE, trigger = %message.kind())
    )]
    pub async fn apply(
        &self,
        correlation_id: CorrelationId,
        message: &IntegrationMessage,
        idempotency_key: Option<&str>,
    ) -> Result<ApplyOutcome> {
        let now = Utc::now();

        let (state, data, version) = match self.load(correlation_id).await? {
            Some(instance) => (instance.state, instance.data, instance.version),
            None if D::is_starting(message) => {
                if D::correlate(message) != Some(correlation_id) {
                    return Err(SagaError::InvalidStart {
                        saga_type: D::SAGA_TYPE,
                        correlation_id,
                        reason: format!("{} belongs to another instance", message.kind()),
                    });
                }
                (D::initial_state(), D::Data::default(), Version::initial())
            }
            None => {
                let reason = format!("no saga for non-starting trigger {}", message.kind());
                tracing::warn!(%correlation_id, %reason, "trigger dropped");
                return Ok(ApplyOutcome::Dropped { reason });
            }
        };

        if state.is_terminal() {
            tracing::debug!(%correlation_id, state = state.as_str(), "saga already finished");
            return Ok(ApplyOutcome::Ignored {
                state: state.as_str(),
                reason: format!("saga is {}", state.as_str()),
            });
        }

        match D::transition(state, &data, message, now) {
            Transition::Ignore { reason } => {
                tracing::warn!(%correlation_id, state = state.as_str(), %reason, "trigger ignored");
                Ok(ApplyOutcome::Ignored {
                    state: state.as_str(),
                    reason,
                })
            }
            Transition::Defer { reason } => {
                tracing::info!(%correlation_id, state = state.as_str(), %reason, "trigger deferred");
                Ok(ApplyOutcome::Deferred {
                    state: state.as_str(),
                    reason,
                })
            }
            Transition::Advance { to, data, outbound } => {
                let outbound_count = outbound.len();
                let outbox = outbound
                    .into_iter()
                    .map(|o| {
                        o.into_outbox(correlation_id)
                            .map(|row| row.max_retries(self.outbox_max_retries))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let commit = SagaCommit::new(
                    D::SAGA_TYPE,
                    correlation_id,
                    to.as_str(),
                    serde_json::to_value(&data)?,
                    version,
                )
                .with_outbox(outbox)
                .with_idempotency_key(idempotency_key.map(str::to_string))
                .committed_at(now);

                let version = self.store.commit_saga(commit).await?;

                metrics::counter!(
                    "saga_transitions_total",
                    "saga_type" => D::SAGA_TYPE,
                    "to" => to.as_str()
                )
                .increment(1);
                tracing::info!(
                    %correlation_id,
                    from = state.as_str(),
                    to = to.as_str(),
                    %version,
                    outbound = outbound_count,
                    "saga transition committed"
                );

                Ok(ApplyOutcome::Applied {
                    from: state.as_str(),
                    to: to.as_str(),
                    version,
                    outbound: outbound_count,
                })
            }
        }
    }
}
