//! Performance benchmarks for snapshot diffing and listing

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use bucketsync::storage::InMemoryStorageClient;
use bucketsync::sync::{diff, SyncEngine};
use bucketsync::types::{DirectorySnapshot, ObjectRecord, Scope, SyncConfig};

/// Source of `size` objects; destination shares 90% of them, a third of
/// those with changed content, plus some extraneous keys
fn snapshots(size: usize) -> (DirectorySnapshot, DirectorySnapshot) {
    let src = (0..size).map(|i| {
        ObjectRecord::new(format!("assets/{:07}.bin", i), i as u64).with_fingerprint(format!("{:x}", i))
    });
    let dest = (0..size)
        .filter(|i| i % 10 != 0)
        .map(|i| {
            let hash = if i % 3 == 0 { i + 1 } else { i };
            ObjectRecord::new(format!("assets/{:07}.bin", i), i as u64)
                .with_fingerprint(format!("{:x}", hash))
        })
        .chain((0..size / 20).map(|i| ObjectRecord::new(format!("stale/{:07}", i), 1)));

    (
        DirectorySnapshot::from_records(Scope::new("site-dev", "public").unwrap(), src),
        DirectorySnapshot::from_records(Scope::new("site-prod", "public").unwrap(), dest),
    )
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");

    for size in [1_000usize, 10_000, 100_000] {
        let (source, dest) = snapshots(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("with_delete", size), &size, |b, _| {
            b.iter(|| diff(black_box(&source), black_box(&dest), true))
        });
        group.bench_with_input(BenchmarkId::new("copy_only", size), &size, |b, _| {
            b.iter(|| diff(black_box(&source), black_box(&dest), false))
        });
    }

    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStorageClient::new();
    for i in 0..10_000 {
        store.put("site-dev", &format!("public/{:05}", i), b"payload");
    }
    let engine = SyncEngine::new(Arc::new(store), SyncConfig::default()).unwrap();
    let scope = Scope::new("site-dev", "public").unwrap();

    let mut group = c.benchmark_group("list");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("10k_objects", |b| {
        b.iter(|| runtime.block_on(engine.list(&scope)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_diff, bench_list);
criterion_main!(benches);
