//! Event store benchmarks.
//!
//! Measures the paths a capture deployment exercises: batched ingestion,
//! per-event commits, point lookups and client scans as trees grow deeper,
//! and a full integrity scrub.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use meowkey_store::{EventKind, EventStore, FileBackend, InMemoryBackend, StoreConfig};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn bench_config() -> StoreConfig {
    StoreConfig::builder().sync_on_commit(false).build().expect("valid config")
}

/// Records `count` keystrokes for `clients` clients in batches.
fn populate(store: &EventStore<InMemoryBackend>, clients: usize, count: usize, batch_size: usize) -> Vec<u32> {
    let hashes: Vec<u32> = (0..clients)
        .map(|c| store.register_client(&format!("{c:03}")).expect("register").hash)
        .collect();

    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        let mut txn = store.begin_write().expect("write txn");
        for i in batch_start..batch_end {
            let client = format!("{:03}", i % clients);
            txn.record_event(EventKind::Keystroke, &client, b"k").expect("record");
        }
        txn.commit().expect("commit");
    }
    hashes
}

// =============================================================================
// Ingestion
// =============================================================================

/// Batched ingestion at various transaction sizes.
fn bench_batched_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/batched");

    for batch_size in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let store = EventStore::open_in_memory_with_config(bench_config()).expect("open store");
            store.register_client("001").expect("register");
            b.iter(|| {
                let mut txn = store.begin_write().expect("write txn");
                for _ in 0..batch_size {
                    black_box(txn.record_event(EventKind::Keystroke, "001", b"keystroke").expect("record"));
                }
                txn.commit().expect("commit");
            });
        });
    }

    group.finish();
}

/// One commit per event against a real file, with and without sync.
fn bench_file_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/file_commit");
    group.throughput(Throughput::Elements(1));

    for sync in [false, true] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let config = StoreConfig::builder().sync_on_commit(sync).build().expect("valid config");
        let store =
            EventStore::<FileBackend>::create_with_config(temp_dir.path().join("bench.meow"), config)
                .expect("create store");
        store.register_client("001").expect("register");

        let name = if sync { "synced" } else { "unsynced" };
        group.bench_function(name, |b| {
            b.iter(|| black_box(store.record_event(EventKind::Window, "001", b"Terminal").expect("record")));
        });
    }

    group.finish();
}

// =============================================================================
// Queries
// =============================================================================

/// Point lookups as the tree grows deeper.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("query/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000usize, 10_000, 100_000] {
        let store = EventStore::open_in_memory_with_config(bench_config()).expect("open store");
        let hashes = populate(&store, 4, count, 1000);
        let per_client = (count / 4) as u32;

        group.bench_with_input(BenchmarkId::new("sequential", format!("{}k", count / 1000)), &count, |b, _| {
            let mut counter = 0u32;
            b.iter(|| {
                counter = (counter + 1) % per_client;
                let snapshot = store.snapshot();
                black_box(snapshot.point_lookup(EventKind::Keystroke, hashes[counter as usize % 4], counter))
            });
        });
    }

    group.finish();
}

/// Full scan of one client's stream among several.
fn bench_client_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("query/client_scan");

    let store = EventStore::open_in_memory_with_config(bench_config()).expect("open store");
    let hashes = populate(&store, 8, 80_000, 1000);
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("10k_of_80k", |b| {
        b.iter(|| {
            let snapshot = store.snapshot();
            let count =
                snapshot.scan(EventKind::Keystroke, hashes[3], 0, u32::MAX).expect("scan").count();
            black_box(count)
        });
    });

    group.finish();
}

// =============================================================================
// Maintenance
// =============================================================================

/// Full integrity scrub.
fn bench_scrub(c: &mut Criterion) {
    let mut group = c.benchmark_group("maintenance/scrub");

    let store = EventStore::open_in_memory_with_config(bench_config()).expect("open store");
    populate(&store, 4, 50_000, 1000);
    group.throughput(Throughput::Elements(50_000));

    group.bench_function("50k_events", |b| b.iter(|| black_box(store.verify().is_clean())));

    group.finish();
}

criterion_group! {
    name = ingest_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batched_ingest, bench_file_commit
}

criterion_group! {
    name = query_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_client_scan
}

criterion_group! {
    name = maintenance_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(10);
    targets = bench_scrub
}

criterion_main!(ingest_benches, query_benches, maintenance_benches);
