//! Worker startup errors.

use message_store::StoreError;
use thiserror::Error;

/// Errors that abort worker startup. Once running, loops log and continue.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid metrics address: {0}")]
    MetricsAddr(#[from] std::net::AddrParseError),

    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Logging setup error: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}
