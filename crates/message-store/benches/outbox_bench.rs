use chrono::Utc;
use contracts::{BillFullyPaidEventMessage, IntegrationMessage, REFERENCE_TYPE_WALLET_DEPOSIT};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use message_store::{InMemoryMessageStore, NewOutboxMessage, OutboxStore};
use uuid::Uuid;

fn bill_paid() -> NewOutboxMessage {
    let message = IntegrationMessage::from(BillFullyPaidEventMessage {
        bill_id: Uuid::new_v4(),
        reference_id: Uuid::new_v4(),
        reference_type: REFERENCE_TYPE_WALLET_DEPOSIT.to_string(),
        paid_amount_rials: 1_500_000,
        payment_id: Some(Uuid::new_v4()),
    });
    NewOutboxMessage::for_message(&message).unwrap()
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox/enqueue_single", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryMessageStore::new();
                store.enqueue(bill_paid()).await.unwrap();
            });
        });
    });
}

fn bench_fetch_due(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("outbox/fetch_due");

    for size in [100, 1_000, 10_000] {
        let store = InMemoryMessageStore::new();
        rt.block_on(async {
            for _ in 0..size {
                store.enqueue(bill_paid()).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let due = store.fetch_due(100, Utc::now()).await.unwrap();
                    assert_eq!(due.len(), 100);
                });
            });
        });
    }

    group.finish();
}

fn bench_describe_message(c: &mut Criterion) {
    c.bench_function("outbox/describe_message", |b| {
        b.iter(bill_paid);
    });
}

criterion_group!(benches, bench_enqueue, bench_fetch_due, bench_describe_message);
criterion_main!(benches);
