use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::saga::state_table;
use crate::store::{IdempotencyLedger, OutboxStore, SagaStateStore};
use crate::{
    AggregateId, BeginOutcome, CorrelationId, DeadLetterQuery, EventIdempotency, MessageId,
    NewOutboxMessage, OutboxMessage, OutboxStats, Result, SagaCommit, SagaRecord, StoreError,
    Version,
};

const SELECT_OUTBOX: &str = r#"
    SELECT id, message_type, full_type_name, assembly_name, content, schema_version,
           occurred_on, processed_on, idempotency_key, aggregate_id, correlation_id,
           retry_count, max_retries, next_retry_at, error, failure_reason,
           is_poison_message, poisoned_at, moved_to_dlq_at, dlq_reason
    FROM outbox_messages
"#;

/// PostgreSQL-backed message store.
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    /// Creates a new PostgreSQL message store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            message_type: row.try_get("message_type")?,
            full_type_name: row.try_get("full_type_name")?,
            assembly_name: row.try_get("assembly_name")?,
            content: row.try_get("content")?,
            schema_version: row.try_get("schema_version")?,
            occurred_on: row.try_get("occurred_on")?,
            processed_on: row.try_get("processed_on")?,
            idempotency_key: row.try_get("idempotency_key")?,
            aggregate_id: row
                .try_get::<Option<Uuid>, _>("aggregate_id")?
                .map(AggregateId::from_uuid),
            correlation_id: row
                .try_get::<Option<Uuid>, _>("correlation_id")?
                .map(CorrelationId::from_uuid),
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error: row.try_get("error")?,
            failure_reason: row.try_get("failure_reason")?,
            is_poison_message: row.try_get("is_poison_message")?,
            poisoned_at: row.try_get("poisoned_at")?,
            moved_to_dlq_at: row.try_get("moved_to_dlq_at")?,
            dlq_reason: row.try_get("dlq_reason")?,
        })
    }

    fn row_to_idempotency(row: PgRow) -> Result<EventIdempotency> {
        Ok(EventIdempotency {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            aggregate_id: row
                .try_get::<Option<Uuid>, _>("aggregate_id")?
                .map(AggregateId::from_uuid),
            is_processed: row.try_get("is_processed")?,
            processed_at: row.try_get("processed_at")?,
            error: row.try_get("error")?,
            reserved_at: row.try_get("reserved_at")?,
        })
    }

    fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            current_state: row.try_get("current_state")?,
            snapshot: row.try_get("snapshot")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn outbox_exists(&self, id: MessageId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outbox_messages WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Error for a dead-letter operation that matched no poisoned row.
    async fn not_poisoned(&self, id: MessageId) -> StoreError {
        match self.outbox_exists(id).await {
            Ok(true) => StoreError::NotPoisoned(id),
            Ok(false) => StoreError::MessageNotFound(id),
            Err(e) => e,
        }
    }
}

/// Inserts a pending row on `conn`, skipping duplicates of the idempotency key.
async fn insert_outbox(conn: &mut PgConnection, message: &OutboxMessage) -> Result<MessageId> {
    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO outbox_messages (
            id, message_type, full_type_name, assembly_name, content, schema_version,
            occurred_on, idempotency_key, aggregate_id, correlation_id,
            retry_count, max_retries, next_retry_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
        RETURNING id
        "#,
    )
    .bind(message.id.as_uuid())
    .bind(&message.message_type)
    .bind(&message.full_type_name)
    .bind(&message.assembly_name)
    .bind(&message.content)
    .bind(message.schema_version)
    .bind(message.occurred_on)
    .bind(&message.idempotency_key)
    .bind(message.aggregate_id.map(|id| id.as_uuid()))
    .bind(message.correlation_id.map(|id| id.as_uuid()))
    .bind(message.retry_count)
    .bind(message.max_retries)
    .bind(message.next_retry_at)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        return Ok(MessageId::from_uuid(id));
    }

    let existing: Uuid =
        sqlx::query_scalar("SELECT id FROM outbox_messages WHERE idempotency_key = $1")
            .bind(&message.idempotency_key)
            .fetch_one(&mut *conn)
            .await?;
    tracing::debug!(
        idempotency_key = ?message.idempotency_key,
        %existing,
        "outbox row already enqueued"
    );
    Ok(MessageId::from_uuid(existing))
}

/// Enqueues `message` inside a caller-owned transaction so it commits or
/// rolls back together with the business write.
pub async fn enqueue_in_transaction(
    tx: &mut Transaction<'_, Postgres>,
    message: NewOutboxMessage,
) -> Result<MessageId> {
    insert_outbox(&mut **tx, &message.into_message()).await
}

#[async_trait]
impl OutboxStore for PostgresMessageStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<MessageId> {
        let mut conn = self.pool.acquire().await?;
        insert_outbox(&mut *conn, &message.into_message()).await
    }

    async fn fetch_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            "{SELECT_OUTBOX}
            WHERE processed_on IS NULL
              AND is_poison_message = FALSE
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY occurred_on ASC
            LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let sql = format!("{SELECT_OUTBOX} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_outbox).transpose()
    }

    async fn mark_processed(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_on = $2, next_retry_at = NULL
            WHERE id = $1 AND processed_on IS NULL AND is_poison_message = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.outbox_exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::MessageNotFound(id))
        }
    }

    async fn save_delivery_failure(&self, message: &OutboxMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET retry_count = $2,
                next_retry_at = $3,
                error = $4,
                failure_reason = $5,
                is_poison_message = $6,
                poisoned_at = $7
            WHERE id = $1 AND processed_on IS NULL AND is_poison_message = FALSE
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.retry_count)
        .bind(message.next_retry_at)
        .bind(&message.error)
        .bind(&message.failure_reason)
        .bind(message.is_poison_message)
        .bind(message.poisoned_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.outbox_exists(message.id).await? {
            return Err(StoreError::MessageNotFound(message.id));
        }
        Ok(())
    }

    async fn list_dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<OutboxMessage>> {
        let mut sql = format!("{SELECT_OUTBOX} WHERE is_poison_message = TRUE");
        let mut param_count = 0;

        // Build dynamic query
        if query.message_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND message_type = ${param_count}"));
        }
        if query.correlation_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND correlation_id = ${param_count}"));
        }
        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        match query.moved_to_dlq {
            Some(true) => sql.push_str(" AND moved_to_dlq_at IS NOT NULL"),
            Some(false) => sql.push_str(" AND moved_to_dlq_at IS NULL"),
            None => {}
        }

        sql.push_str(" ORDER BY poisoned_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(message_type) = query.message_type {
            sqlx_query = sqlx_query.bind(message_type);
        }
        if let Some(id) = query.correlation_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn move_to_dlq(&self, id: MessageId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET moved_to_dlq_at = $2, dlq_reason = $3
            WHERE id = $1 AND is_poison_message = TRUE
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_poisoned(id).await);
        }
        Ok(())
    }

    async fn replay(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET is_poison_message = FALSE,
                poisoned_at = NULL,
                moved_to_dlq_at = NULL,
                dlq_reason = NULL,
                retry_count = 0,
                next_retry_at = NULL,
                error = NULL,
                failure_reason = NULL
            WHERE id = $1 AND is_poison_message = TRUE
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_poisoned(id).await);
        }
        Ok(())
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE processed_on IS NOT NULL AND processed_on < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_on IS NULL AND is_poison_message = FALSE) AS pending,
                COUNT(*) FILTER (WHERE processed_on IS NOT NULL) AS processed,
                COUNT(*) FILTER (WHERE is_poison_message = TRUE) AS poisoned
            FROM outbox_messages
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            processed: row.try_get::<i64, _>("processed")? as u64,
            poisoned: row.try_get::<i64, _>("poisoned")? as u64,
        })
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresMessageStore {
    async fn try_begin(&self, key: &str, aggregate_id: Option<AggregateId>) -> Result<BeginOutcome> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO event_idempotency (id, idempotency_key, aggregate_id, reserved_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(aggregate_id.map(|id| id.as_uuid()))
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(BeginOutcome::Proceed);
        }

        let is_processed: Option<bool> = sqlx::query_scalar(
            "SELECT is_processed FROM event_idempotency WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match is_processed {
            Some(true) => BeginOutcome::AlreadyProcessed,
            // A row released between the two statements counts as in flight;
            // the caller redelivers and reserves on the next attempt.
            Some(false) | None => BeginOutcome::InFlight,
        })
    }

    async fn mark_processed(&self, key: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_idempotency
            SET is_processed = TRUE, processed_at = NOW()
            WHERE idempotency_key = $1 AND is_processed = FALSE AND error IS NULL
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::IdempotencyKeyNotReserved(key.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_idempotency
            SET error = $2
            WHERE idempotency_key = $1 AND is_processed = FALSE AND error IS NULL
            "#,
        )
        .bind(key)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::IdempotencyKeyNotReserved(key.to_string()));
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM event_idempotency WHERE idempotency_key = $1 AND is_processed = FALSE",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_record(key).await?.is_some() {
            return Err(StoreError::IdempotencyKeyNotReserved(key.to_string()));
        }
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<EventIdempotency>> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, aggregate_id, is_processed, processed_at, error, reserved_at
            FROM event_idempotency
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_idempotency).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn reclaim_stale(&self, reserved_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_idempotency
            WHERE is_processed = FALSE AND error IS NULL AND reserved_at < $1
            "#,
        )
        .bind(reserved_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SagaStateStore for PostgresMessageStore {
    async fn load_saga(
        &self,
        saga_type: &'static str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        let table = state_table(saga_type)?;
        let sql = format!(
            "SELECT correlation_id, current_state, snapshot, version, created_at, updated_at
             FROM {table}
             WHERE correlation_id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(correlation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(
        skip(self, commit),
        fields(saga_type = commit.saga_type, correlation_id = %commit.correlation_id)
    )]
    async fn commit_saga(&self, commit: SagaCommit) -> Result<Version> {
        let table = state_table(commit.saga_type)?;
        let new_version = commit.new_version();

        // Start a transaction
        let mut tx = self.pool.begin().await?;

        let written = if commit.is_creation() {
            let sql = format!(
                "INSERT INTO {table} (correlation_id, current_state, snapshot, version, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $5)
                 ON CONFLICT (correlation_id) DO NOTHING"
            );
            sqlx::query(&sql)
                .bind(commit.correlation_id.as_uuid())
                .bind(&commit.current_state)
                .bind(&commit.snapshot)
                .bind(new_version.as_i64())
                .bind(commit.committed_at)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            let sql = format!(
                "UPDATE {table}
                 SET current_state = $2, snapshot = $3, version = $4, updated_at = $5
                 WHERE correlation_id = $1 AND version = $6"
            );
            sqlx::query(&sql)
                .bind(commit.correlation_id.as_uuid())
                .bind(&commit.current_state)
                .bind(&commit.snapshot)
                .bind(new_version.as_i64())
                .bind(commit.committed_at)
                .bind(commit.expected_version.as_i64())
                .execute(&mut *tx)
                .await?
                .rows_affected()
        };

        if written == 0 {
            let sql = format!("SELECT version FROM {table} WHERE correlation_id = $1");
            let actual: Option<i64> = sqlx::query_scalar(&sql)
                .bind(commit.correlation_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

            tracing::debug!(expected = %commit.expected_version, ?actual, "stale saga version");
            return Err(StoreError::ConcurrencyConflict {
                saga_type: commit.saga_type.to_string(),
                correlation_id: commit.correlation_id,
                expected: commit.expected_version,
                actual: Version::new(actual.unwrap_or(0)),
            });
        }

        for message in commit.outbox {
            insert_outbox(&mut *tx, &message.into_message()).await?;
        }

        if let Some(ref key) = commit.idempotency_key {
            let marked = sqlx::query(
                r#"
                UPDATE event_idempotency
                SET is_processed = TRUE, processed_at = $2
                WHERE idempotency_key = $1 AND is_processed = FALSE AND error IS NULL
                "#,
            )
            .bind(key)
            .bind(commit.committed_at)
            .execute(&mut *tx)
            .await?;

            if marked.rows_affected() == 0 {
                return Err(StoreError::IdempotencyKeyNotReserved(key.clone()));
            }
        }

        tx.commit().await?;
        Ok(new_version)
    }

    async fn find_sagas(&self, saga_type: &'static str, state: &str) -> Result<Vec<SagaRecord>> {
        let table = state_table(saga_type)?;
        let sql = format!(
            "SELECT correlation_id, current_state, snapshot, version, created_at, updated_at
             FROM {table}
             WHERE current_state = $1
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
