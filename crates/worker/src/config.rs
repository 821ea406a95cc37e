//! Worker configuration loaded from environment variables.

use std::time::Duration;

use message_store::RetryPolicy;
use message_store::outbox::DEFAULT_MAX_RETRIES;
use outbox::DispatcherConfig;
use tokio::sync::Semaphore;

/// Immutable snapshot of the worker's settings, read once at startup.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (in-memory store when unset)
/// - `OUTBOX_BATCH_SIZE`: rows per dispatch pass (default: `100`)
/// - `OUTBOX_POLL_INTERVAL_MS`: idle sleep between passes (default: `1000`)
/// - `OUTBOX_MAX_RETRIES`: publish attempts before a row is poisoned (default: `5`)
/// - `OUTBOX_RETRY_BASE_MS`: first backoff delay (default: `2000`)
/// - `OUTBOX_RETRY_MAX_MS`: backoff ceiling (default: `300000`)
/// - `OUTBOX_PUBLISH_CONCURRENCY`: rows published concurrently (default: `8`)
/// - `CONSUMER_CONCURRENCY`: messages handled concurrently (default: `16`,
///   capped at what one semaphore can hand out)
/// - `SAGA_MAX_CONFLICT_RETRIES`: reloads after a version conflict (default: `3`)
/// - `OUTBOX_RETENTION_HOURS`: age at which processed rows are purged
///   (default: `168`)
/// - `IDEMPOTENCY_STALE_AFTER_SECS`: age at which an unfinished reservation
///   is reclaimed (default: `300`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
///
/// Unparsable numbers fall back to their default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_max_retries: i32,
    pub outbox_retry_base: Duration,
    pub outbox_retry_max: Duration,
    pub outbox_publish_concurrency: usize,
    pub consumer_concurrency: usize,
    pub saga_max_conflict_retries: u32,
    pub outbox_retention: Duration,
    pub idempotency_stale_after: Duration,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_json: bool,
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str, default: u64| -> u64 {
            lookup(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            outbox_batch_size: number("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size as u64)
                .max(1) as usize,
            outbox_poll_interval: Duration::from_millis(number(
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.outbox_poll_interval.as_millis() as u64,
            )),
            outbox_max_retries: number("OUTBOX_MAX_RETRIES", defaults.outbox_max_retries as u64)
                .clamp(1, i32::MAX as u64) as i32,
            outbox_retry_base: Duration::from_millis(number(
                "OUTBOX_RETRY_BASE_MS",
                defaults.outbox_retry_base.as_millis() as u64,
            )),
            outbox_retry_max: Duration::from_millis(number(
                "OUTBOX_RETRY_MAX_MS",
                defaults.outbox_retry_max.as_millis() as u64,
            )),
            outbox_publish_concurrency: number(
                "OUTBOX_PUBLISH_CONCURRENCY",
                defaults.outbox_publish_concurrency as u64,
            )
            .max(1) as usize,
            consumer_concurrency: number(
                "CONSUMER_CONCURRENCY",
                defaults.consumer_concurrency as u64,
            )
            .clamp(1, max_consumer_concurrency() as u64) as usize,
            saga_max_conflict_retries: number(
                "SAGA_MAX_CONFLICT_RETRIES",
                defaults.saga_max_conflict_retries as u64,
            )
            .min(u32::MAX as u64) as u32,
            outbox_retention: Duration::from_secs(
                number(
                    "OUTBOX_RETENTION_HOURS",
                    defaults.outbox_retention.as_secs() / 3600,
                )
                .saturating_mul(3600),
            ),
            idempotency_stale_after: Duration::from_secs(number(
                "IDEMPOTENCY_STALE_AFTER_SECS",
                defaults.idempotency_stale_after.as_secs(),
            )),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.outbox_retry_base, self.outbox_retry_max)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            retry_policy: self.retry_policy(),
            publish_concurrency: self.outbox_publish_concurrency,
        }
    }
}

/// Upper bound for `consumer_concurrency`: the consumer reclaims every
/// permit at once on shutdown, which takes a `u32`.
fn max_consumer_concurrency() -> usize {
    Semaphore::MAX_PERMITS.min(u32::MAX as usize)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            outbox_batch_size: 100,
            outbox_poll_interval: Duration::from_millis(1000),
            outbox_max_retries: DEFAULT_MAX_RETRIES,
            outbox_retry_base: Duration::from_millis(2000),
            outbox_retry_max: Duration::from_millis(300_000),
            outbox_publish_concurrency: 8,
            consumer_concurrency: 16,
            saga_max_conflict_retries: 3,
            outbox_retention: Duration::from_secs(7 * 24 * 3600),
            idempotency_stale_after: Duration::from_secs(300),
            metrics_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.database_url, None);
        assert_eq!(config.outbox_batch_size, 100);
        assert_eq!(config.outbox_max_retries, 5);
        assert_eq!(config.consumer_concurrency, 16);
        assert_eq!(config.metrics_addr, "0.0.0.0:9000");
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/messaging"),
            ("OUTBOX_BATCH_SIZE", "250"),
            ("OUTBOX_POLL_INTERVAL_MS", "50"),
            ("OUTBOX_MAX_RETRIES", "3"),
            ("SAGA_MAX_CONFLICT_RETRIES", "7"),
            ("IDEMPOTENCY_STALE_AFTER_SECS", "60"),
            ("OUTBOX_RETENTION_HOURS", "24"),
            ("LOG_FORMAT", "JSON"),
        ]);

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/messaging")
        );
        assert_eq!(config.outbox_batch_size, 250);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(50));
        assert_eq!(config.outbox_max_retries, 3);
        assert_eq!(config.saga_max_conflict_retries, 7);
        assert_eq!(config.idempotency_stale_after, Duration::from_secs(60));
        assert_eq!(config.outbox_retention, Duration::from_secs(24 * 3600));
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = from_pairs(&[
            ("OUTBOX_BATCH_SIZE", "lots"),
            ("OUTBOX_MAX_RETRIES", "0"),
            ("CONSUMER_CONCURRENCY", "0"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(config.outbox_batch_size, 100);
        assert_eq!(config.outbox_max_retries, 1);
        assert_eq!(config.consumer_concurrency, 1);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn test_consumer_concurrency_is_capped() {
        let config = from_pairs(&[("CONSUMER_CONCURRENCY", "18446744073709551615")]);
        assert_eq!(config.consumer_concurrency, max_consumer_concurrency());
        assert!(config.consumer_concurrency <= u32::MAX as usize);
        assert!(config.consumer_concurrency <= Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_dispatcher_config() {
        let config = from_pairs(&[
            ("OUTBOX_RETRY_BASE_MS", "100"),
            ("OUTBOX_RETRY_MAX_MS", "1000"),
            ("OUTBOX_PUBLISH_CONCURRENCY", "4"),
        ]);
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.batch_size, 100);
        assert_eq!(dispatcher.publish_concurrency, 4);
        assert_eq!(dispatcher.retry_policy.base_delay, Duration::from_millis(100));
        assert_eq!(dispatcher.retry_policy.max_delay, Duration::from_millis(1000));
    }
}
