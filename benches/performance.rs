//! Performance benchmarks for the subscription engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use persub::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, LowWaterMark};
use persub::subscriptions::{ConnectionRequest, InstanceContext, SubscriptionConfig, SubscriptionInstance};
use persub::{
    EngineConfig, EventData, EventLog, InMemoryLog, LogReader, MemoryCheckpointStore, Position,
    RetryPolicy, SubscriptionKey,
};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

fn seeded_log(events: usize) -> Arc<InMemoryLog> {
    let log = Arc::new(InMemoryLog::new());
    let batch: Vec<_> = (0..events)
        .map(|i| EventData::raw("OrderPlaced", (i as u64).to_le_bytes().to_vec()))
        .collect();
    log.append("orders", batch).unwrap();
    log
}

fn instance(log: Arc<InMemoryLog>, config: SubscriptionConfig) -> SubscriptionInstance {
    let ctx = InstanceContext {
        reader: LogReader::new(log, RetryPolicy::none()),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
        engine: EngineConfig::manual(),
    };
    SubscriptionInstance::new(
        SubscriptionKey::new("orders", "billing"),
        config,
        ctx,
        Instant::now(),
    )
}

/// Deliver and ack a backlog with a varying number of competing consumers.
fn bench_dispatch_and_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_and_ack");
    let events = 5_000;
    let log = seeded_log(events);
    group.throughput(Throughput::Elements(events as u64));

    for consumers in [1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, &consumers| {
                b.iter(|| {
                    let mut sub = instance(log.clone(), SubscriptionConfig::default());
                    let now = Instant::now();
                    let handles: Vec<_> = (0..consumers)
                        .map(|i| {
                            sub.attach(ConnectionRequest::new("bench", format!("c{}", i), 10), now)
                        })
                        .collect();

                    let mut acked = 0;
                    while acked < events {
                        for handle in &handles {
                            let ids: Vec<_> =
                                handle.drain().iter().map(|d| d.event.event_id()).collect();
                            acked += sub.ack(&ids, now);
                        }
                    }
                    black_box(sub.confirmed_position())
                });
            },
        );
    }

    group.finish();
}

/// Pull consumption through read_next.
fn bench_read_next(c: &mut Criterion) {
    let log = seeded_log(2_000);

    c.bench_function("read_next_batches_of_100", |b| {
        b.iter(|| {
            let mut sub = instance(log.clone(), SubscriptionConfig::default());
            let now = Instant::now();
            loop {
                let events = sub.read_next(100, now);
                if events.is_empty() {
                    break;
                }
                let ids: Vec<_> = events.iter().map(|e| e.event_id()).collect();
                sub.ack(&ids, now);
            }
            black_box(sub.confirmed_position())
        });
    });
}

/// Resolve positions out of order.
fn bench_low_water_mark(c: &mut Criterion) {
    let mut group = c.benchmark_group("low_water_mark");

    for pending in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("pending", pending), &pending, |b, &n| {
            b.iter(|| {
                let mut mark = LowWaterMark::starting_at(None);
                for p in 0..n {
                    mark.track(Position(p));
                }
                // Evens first, then odds.
                for p in (0..n).step_by(2).chain((1..n).step_by(2)) {
                    mark.resolve(Position(p));
                }
                black_box(mark.confirmed())
            });
        });
    }

    group.finish();
}

/// Durable checkpoint writes.
fn bench_file_checkpoint(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(dir.path()).unwrap();
    let key = SubscriptionKey::new("orders", "billing");
    let mut position = 0u64;

    c.bench_function("file_checkpoint_persist", |b| {
        b.iter(|| {
            position += 1;
            store
                .persist(&key, Checkpoint::at(Position(position)))
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_dispatch_and_ack,
    bench_read_next,
    bench_low_water_mark,
    bench_file_checkpoint,
);
criterion_main!(benches);
