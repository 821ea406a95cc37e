//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p message-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use contracts::{
    CreateBillCommandMessage, IntegrationMessage, REFERENCE_TYPE_TOUR_RESERVATION,
};
use message_store::{
    BeginOutcome, CorrelationId, DeadLetterQuery, FailureOutcome, IdempotencyLedger,
    NewOutboxMessage, OutboxStatus, OutboxStore, PostgresMessageStore, RetryPolicy, SagaCommit,
    SagaStateStore, StoreError, Version, enqueue_in_transaction,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            // Run migrations using raw_sql to execute multiple statements
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_messaging_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresMessageStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE outbox_messages, event_idempotency, \
         reservation_payment_saga_state, wallet_deposit_saga_state",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresMessageStore::new(pool)
}

fn create_bill() -> NewOutboxMessage {
    let message = IntegrationMessage::from(CreateBillCommandMessage {
        reference_id: Uuid::new_v4(),
        reference_type: REFERENCE_TYPE_TOUR_RESERVATION.to_string(),
        reference_tracking_code: "TR-2041".to_string(),
        external_user_id: Uuid::new_v4(),
        user_full_name: "Reza Ahmadi".to_string(),
        amount_rials: 12_000_000,
        currency: "IRR".to_string(),
        description: "Tour reservation TR-2041".to_string(),
    });
    NewOutboxMessage::for_message(&message).unwrap()
}

#[tokio::test]
#[serial]
async fn enqueue_and_fetch_round_trip() {
    let store = get_test_store().await;
    let correlation_id = CorrelationId::new();

    let id = store
        .enqueue(create_bill().correlation_id(correlation_id).max_retries(3))
        .await
        .unwrap();

    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, id);
    assert_eq!(due[0].message_type, "CreateBillCommandMessage");
    assert_eq!(due[0].correlation_id, Some(correlation_id));
    assert_eq!(due[0].max_retries, 3);
    assert!(due[0].to_envelope().decode().is_ok());
}

#[tokio::test]
#[serial]
async fn duplicate_idempotency_key_returns_existing_row() {
    let store = get_test_store().await;

    let first = store
        .enqueue(create_bill().idempotency_key("reservation-bill:1"))
        .await
        .unwrap();
    let second = store
        .enqueue(create_bill().idempotency_key("reservation-bill:1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
#[serial]
async fn scheduled_row_waits_for_its_time() {
    let store = get_test_store().await;
    let at = Utc::now() + TimeDelta::minutes(10);
    store.enqueue(create_bill().deliver_after(at)).await.unwrap();

    assert!(store.fetch_due(10, Utc::now()).await.unwrap().is_empty());
    assert_eq!(store.fetch_due(10, at).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn mark_processed_happens_once() {
    let store = get_test_store().await;
    let id = store.enqueue(create_bill()).await.unwrap();

    assert!(OutboxStore::mark_processed(&store, id, Utc::now()).await.unwrap());
    assert!(!OutboxStore::mark_processed(&store, id, Utc::now()).await.unwrap());

    let row = store.get_message(id).await.unwrap().unwrap();
    assert_eq!(row.status(), OutboxStatus::Processed);
}

#[tokio::test]
#[serial]
async fn repeated_failures_poison_the_row() {
    let store = get_test_store().await;
    let id = store.enqueue(create_bill().max_retries(3)).await.unwrap();
    let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

    let mut now = Utc::now();
    for attempt in 1..=3 {
        let mut row = store.fetch_due(10, now).await.unwrap().remove(0);
        let outcome = row.register_failure("broker unavailable", now, &policy);
        store.save_delivery_failure(&row).await.unwrap();

        if attempt < 3 {
            assert!(matches!(outcome, FailureOutcome::Retry { .. }));
        } else {
            assert_eq!(outcome, FailureOutcome::Poisoned);
        }
        now += TimeDelta::seconds(30);
    }

    assert!(store.fetch_due(10, now).await.unwrap().is_empty());
    let letters = store.list_dead_letters(DeadLetterQuery::new()).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
    assert_eq!(letters[0].retry_count, 3);
}

#[tokio::test]
#[serial]
async fn dead_letter_move_and_replay() {
    let store = get_test_store().await;
    let id = store.enqueue(create_bill()).await.unwrap();

    assert!(matches!(
        store.replay(id).await,
        Err(StoreError::NotPoisoned(_))
    ));

    let mut row = store.get_message(id).await.unwrap().unwrap();
    row.poison("fails to deserialize", Utc::now());
    store.save_delivery_failure(&row).await.unwrap();

    store.move_to_dlq(id, "exported to archive", Utc::now()).await.unwrap();
    let moved = store
        .list_dead_letters(DeadLetterQuery::new().moved().message_type("CreateBillCommandMessage"))
        .await
        .unwrap();
    assert_eq!(moved.len(), 1);

    store.replay(id).await.unwrap();
    assert_eq!(store.fetch_due(10, Utc::now()).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn enqueue_in_transaction_rolls_back_with_business_write() {
    let store = get_test_store().await;

    let mut tx = store.pool().begin().await.unwrap();
    enqueue_in_transaction(&mut tx, create_bill()).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(store.stats().await.unwrap().pending, 0);

    let mut tx = store.pool().begin().await.unwrap();
    enqueue_in_transaction(&mut tx, create_bill()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
#[serial]
async fn purge_processed_rows() {
    let store = get_test_store().await;
    let id = store.enqueue(create_bill()).await.unwrap();
    store.enqueue(create_bill()).await.unwrap();
    OutboxStore::mark_processed(&store, id, Utc::now() - TimeDelta::days(2))
        .await
        .unwrap();

    let purged = store
        .purge_processed(Utc::now() - TimeDelta::days(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_message(id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn idempotency_ledger_states() {
    let store = get_test_store().await;

    assert_eq!(store.try_begin("k1", None).await.unwrap(), BeginOutcome::Proceed);
    assert_eq!(store.try_begin("k1", None).await.unwrap(), BeginOutcome::InFlight);

    IdempotencyLedger::mark_processed(&store, "k1").await.unwrap();
    assert_eq!(
        store.try_begin("k1", None).await.unwrap(),
        BeginOutcome::AlreadyProcessed
    );
    assert!(matches!(
        store.mark_failed("k1", "late failure").await,
        Err(StoreError::IdempotencyKeyNotReserved(_))
    ));

    store.try_begin("k2", None).await.unwrap();
    store.release("k2").await.unwrap();
    assert_eq!(store.try_begin("k2", None).await.unwrap(), BeginOutcome::Proceed);

    let reclaimed = store
        .reclaim_stale(Utc::now() + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);
    assert!(store.get_record("k1").await.unwrap().unwrap().is_processed);
}

#[tokio::test]
#[serial]
async fn concurrent_try_begin_has_one_winner() {
    let store = get_test_store().await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.try_begin("bill-paid:race", None).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() == BeginOutcome::Proceed {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
async fn saga_commit_is_atomic_and_versioned() {
    let store = get_test_store().await;
    let id = CorrelationId::new();
    store.try_begin("reservation_payment:m1", None).await.unwrap();

    let created = SagaCommit::new(
        "reservation_payment",
        id,
        "AwaitingBill",
        serde_json::json!({"tracking_code": "TR-2041"}),
        Version::initial(),
    )
    .with_outbox(vec![create_bill().idempotency_key("reservation-bill:x")])
    .with_idempotency_key(Some("reservation_payment:m1".to_string()));
    assert_eq!(store.commit_saga(created).await.unwrap(), Version::first());

    assert_eq!(store.stats().await.unwrap().pending, 1);
    assert!(store
        .get_record("reservation_payment:m1")
        .await
        .unwrap()
        .unwrap()
        .is_processed);

    // A stale writer loses and leaves nothing behind.
    let stale = SagaCommit::new(
        "reservation_payment",
        id,
        "Failed",
        serde_json::json!({}),
        Version::initial(),
    )
    .with_outbox(vec![create_bill()]);
    let err = store.commit_saga(stale).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConcurrencyConflict { actual, .. } if actual == Version::first()
    ));
    assert_eq!(store.stats().await.unwrap().pending, 1);

    let advanced = SagaCommit::new(
        "reservation_payment",
        id,
        "AwaitingPayment",
        serde_json::json!({"bill_number": "B-77"}),
        Version::first(),
    );
    assert_eq!(store.commit_saga(advanced).await.unwrap(), Version::new(2));

    let record = store
        .load_saga("reservation_payment", id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_state, "AwaitingPayment");
    assert_eq!(record.snapshot["bill_number"], "B-77");

    let found = store
        .find_sagas("reservation_payment", "AwaitingPayment")
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
#[serial]
async fn unreserved_key_rolls_back_saga_commit() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let commit = SagaCommit::new(
        "wallet_deposit",
        id,
        "Requested",
        serde_json::json!({}),
        Version::initial(),
    )
    .with_outbox(vec![create_bill()])
    .with_idempotency_key(Some("never-reserved".to_string()));

    assert!(matches!(
        store.commit_saga(commit).await,
        Err(StoreError::IdempotencyKeyNotReserved(_))
    ));
    assert!(store.load_saga("wallet_deposit", id).await.unwrap().is_none());
    assert_eq!(store.stats().await.unwrap().pending, 0);
}
