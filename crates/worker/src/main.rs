//! Worker entry point.
//!
//! The bundled transport is the in-process [`InMemoryTransport`]: a row is
//! marked processed once the in-process channel accepts it, and scheduled
//! redeliveries live only in memory. Crash safety end to end requires a
//! durable broker implementing [`outbox::Transport`] and
//! [`outbox::MessageSource`].

use std::net::SocketAddr;

use message_store::{InMemoryMessageStore, PostgresMessageStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use outbox::InMemoryTransport;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::{Worker, WorkerConfig, WorkerError};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &WorkerConfig) -> Result<(), WorkerError> {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration and initialize tracing
    let config = WorkerConfig::from_env();
    init_tracing(&config)?;

    // 2. Install Prometheus metrics exporter
    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    tracing::info!(%metrics_addr, "metrics exporter listening");

    // 3. Translate OS signals into the shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // 4. Choose the store and run; published envelopes are not retained
    let transport = InMemoryTransport::with_log_capacity(0);
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections((config.consumer_concurrency as u32).saturating_add(4))
                .connect(&url)
                .await?;
            let store = PostgresMessageStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL message store");
            tracing::warn!(
                "in-memory transport: published and redelivering messages are lost on crash, \
                 the durable outbox does not cover them"
            );
            Worker::new(store, transport, config).run(shutdown_rx).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory message store");
            Worker::new(InMemoryMessageStore::new(), transport, config)
                .run(shutdown_rx)
                .await;
        }
    }

    Ok(())
}
