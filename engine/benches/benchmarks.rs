//! Performance benchmarks for tether-engine

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use tether_engine::{
    compute_changes, integrity, order_for_drain, BackupDocument, ConflictResolver,
    ConflictStrategy, EnqueueOptions, OperationKind, Priority, QueuedOperation, SyncCheckpoint,
};

fn meeting(i: u64, revision: u64) -> Value {
    json!({
        "id": format!("meeting_{}", i),
        "title": format!("Meeting {} rev {}", i, revision),
        "attendees": ["ana", "ben", format!("guest_{}", revision)],
        "meta": {"room": i % 7, "recorded": revision % 2 == 0},
        "updatedAt": 1706745600000u64 + revision,
    })
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");

    group.bench_function("detect_identical", |b| {
        let record = meeting(1, 1);
        b.iter(|| {
            let mut resolver = ConflictResolver::new(ConflictStrategy::SmartMerge);
            resolver.detect_conflicts(black_box(&record), black_box(&record), "meetings:1", 0)
        })
    });

    group.bench_function("detect_and_merge", |b| {
        let local = meeting(1, 1);
        let remote = meeting(1, 2);
        b.iter(|| {
            let mut resolver = ConflictResolver::new(ConflictStrategy::SmartMerge);
            let conflicts = resolver.detect_conflicts(&local, &remote, "meetings:1", 0);
            for conflict in conflicts {
                let _ = resolver.auto_resolve(&conflict.id, 1);
            }
        })
    });

    group.finish();
}

fn bench_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental");

    for size in [100u64, 1000, 10000] {
        let records: Vec<Value> = (0..size).map(|i| meeting(i, 1)).collect();
        let checkpoint = SyncCheckpoint::initial("meetings")
            .advance(&records, 1706745600000)
            .unwrap();
        let mut current = records.clone();
        for record in current.iter_mut().step_by(10) {
            record["updatedAt"] = json!(1706745700000u64);
        }

        group.bench_with_input(
            BenchmarkId::new("compute_changes", size),
            &current,
            |b, current| {
                b.iter(|| {
                    compute_changes(
                        "meetings",
                        black_box(current),
                        Some(&checkpoint),
                        1706745800000,
                    )
                })
            },
        );
    }

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for size in [100u64, 1000] {
        let ops: Vec<QueuedOperation> = (0..size)
            .map(|i| {
                let priority = match i % 3 {
                    0 => Priority::Low,
                    1 => Priority::Medium,
                    _ => Priority::High,
                };
                QueuedOperation::new(
                    format!("op_{}", i),
                    OperationKind::Update,
                    "meetings",
                    meeting(i, 1),
                    size - i,
                    EnqueueOptions::default().with_priority(priority),
                )
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("order_for_drain", size), &ops, |b, ops| {
            b.iter(|| order_for_drain(black_box(ops.clone())))
        });
    }

    group.finish();
}

fn bench_backup(c: &mut Criterion) {
    let mut group = c.benchmark_group("backup");

    for size in [100u64, 1000] {
        let mut data = BTreeMap::new();
        data.insert(
            "meetings".to_string(),
            (0..size).map(|i| meeting(i, 1)).collect::<Vec<_>>(),
        );
        let document = BackupDocument::new(1706745600000, data, None).unwrap();
        let bytes = document.to_bytes().unwrap();

        group.bench_with_input(BenchmarkId::new("verify", size), &bytes, |b, bytes| {
            b.iter(|| {
                let parsed = BackupDocument::from_slice(black_box(bytes)).unwrap();
                parsed.verify_checksum()
            })
        });

        group.bench_with_input(
            BenchmarkId::new("checksum_records", size),
            &document,
            |b, document| b.iter(|| integrity::checksum_records(document.records("meetings"))),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_conflicts,
    bench_changes,
    bench_queue,
    bench_backup
);
criterion_main!(benches);
