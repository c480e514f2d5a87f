//! Benchmarks for pool and dispatch operations using criterion.
//!
//! These benchmarks measure:
//! - Uncontended acquire and release on a single worker
//! - Acquire/release under contention from concurrent tasks
//! - A full batch dispatched over mock workers

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flock::*;
use flock_testkit::{MockAdapter, fast_config, running_pool};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn start_pool(rt: &Runtime, workers: usize) -> PoolManager {
    rt.block_on(async {
        let adapters = (0..workers).map(|_| Arc::new(MockAdapter::new())).collect();
        running_pool(fast_config(), adapters).await.0
    })
}

/// Benchmark: acquire then release with no other holders.
fn bench_acquire_release(c: &mut Criterion) {
    let rt = create_runtime();
    let pool = start_pool(&rt, 1);

    let mut group = c.benchmark_group("acquire_release");
    group.sample_size(100);

    group.bench_function("single_worker", |b| {
        b.to_async(&rt).iter(|| async {
            let lease = pool
                .acquire(Some(Duration::from_secs(1)))
                .await
                .expect("acquire should succeed");
            lease.release();
        });
    });

    group.finish();
}

/// Benchmark: many tasks contending for a few workers.
fn bench_contention(c: &mut Criterion) {
    let rt = create_runtime();
    let task_counts = [4usize, 16, 64];

    let mut group = c.benchmark_group("acquire_contention");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(10));

    for tasks in task_counts {
        let pool = start_pool(&rt, 4);
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::new("tasks", tasks), &tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let pool = pool.clone();
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let pool = pool.clone();
                            tokio::spawn(async move {
                                let lease = pool
                                    .acquire(Some(Duration::from_secs(5)))
                                    .await
                                    .expect("acquire should succeed");
                                lease.release();
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.expect("task should not panic");
                    }
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: dispatch a batch end to end.
fn bench_dispatch_batch(c: &mut Criterion) {
    let rt = create_runtime();
    let pool = start_pool(&rt, 4);
    let engine = DispatchEngine::new(pool, DispatchConfig::default());
    let session = Session::new(Arc::new(User::new("bench")));

    let mut group = c.benchmark_group("dispatch_batch");
    group.sample_size(30);

    for count in [1u32, 8, 32] {
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::new("units", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let (mut events, handle) =
                    engine.spawn(session.clone(), GenerationRequest::new("bench"), count);
                while events.recv().await.is_some() {}
                let summary = handle.await.expect("dispatch should not panic");
                assert!(summary.is_success());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_contention,
    bench_dispatch_batch
);
criterion_main!(benches);
