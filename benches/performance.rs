//! Performance benchmarks for the envelope store and live dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use courier::{
    Context, Envelope, EnvelopeStore, ListenerFilter, ListenerRegistry, NewEnvelope, StoreConfig,
    Timestamp, Topic, TopicCursors, TopicKind, VectorClock,
};
use std::sync::Arc;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> EnvelopeStore {
    EnvelopeStore::create(StoreConfig {
        sync_on_commit: false,
        ..StoreConfig::at(dir.path().join("store"))
    })
    .unwrap()
}

fn topic(i: usize) -> Topic {
    Topic::new(TopicKind::GroupMessages, format!("group-{}", i).as_bytes())
}

fn rows(originator: u32, count: u64, topics: usize) -> Vec<NewEnvelope> {
    (1..=count)
        .map(|s| {
            NewEnvelope::new(
                originator,
                s,
                topic(s as usize % topics),
                vec![0u8; 256],
            )
        })
        .collect()
}

/// Batch inserts of 256-byte envelopes at varying batch sizes
fn bench_insert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_batch");

    for batch_size in [1u64, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("batch_size", batch_size),
            &batch_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);
                let mut next = 1u64;

                b.iter(|| {
                    let batch: Vec<_> = (next..next + size)
                        .map(|s| NewEnvelope::new(1, s, topic(0), vec![0u8; 256]))
                        .collect();
                    next += size;
                    black_box(store.insert_batch(&batch).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Catch-up reads across many topic cursors
fn bench_topic_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_catch_up");

    for topics in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::new("topics", topics), &topics, |b, &topics| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            for originator in 1..=4 {
                store.insert_batch(&rows(originator, 2_000, topics)).unwrap();
            }
            let cursors: TopicCursors = (0..topics)
                .map(|i| (topic(i), VectorClock::new()))
                .collect();
            let per_topic = (1_000 / topics).max(1);

            b.iter(|| {
                black_box(
                    store
                        .select_by_topic_cursors(&cursors, per_topic, 1_000)
                        .unwrap(),
                );
            });
        });
    }

    group.finish();
}

/// Fan-out of one live batch to topic listeners
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for listeners in [10usize, 100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("listeners", listeners),
            &listeners,
            |b, &listeners| {
                let registry = ListenerRegistry::new();
                let ctx = Context::background();
                let receivers: Vec<_> = (0..listeners)
                    .map(|i| {
                        registry.listen(&ctx, ListenerFilter::topics([topic(i % 10)]), 1_024)
                    })
                    .collect();
                let batch: Vec<_> = (1..=50u64)
                    .map(|s| {
                        Arc::new(Envelope {
                            originator_id: 1,
                            sequence_id: s,
                            topic: topic(s as usize % 10),
                            payload: vec![0u8; 64],
                            insert_time: Timestamp::now(),
                            expiry: None,
                            payer_id: None,
                        })
                    })
                    .collect();

                b.iter(|| {
                    black_box(registry.dispatch(&batch));
                    for rx in &receivers {
                        rx.try_iter().for_each(drop);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_batch,
    bench_topic_catch_up,
    bench_dispatch
);
criterion_main!(benches);
