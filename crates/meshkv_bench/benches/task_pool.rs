//! Task pool benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshkv_bench::{init_tracing, wait_count};
use meshkv_core::TaskPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TASKS: usize = 1_000;

/// Benchmark untagged scheduling across pool sizes.
fn bench_generic_tasks(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("pool_generic");
    group.throughput(Throughput::Elements(TASKS as u64));

    for threads in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let pool = TaskPool::new();
            pool.start(threads, threads).unwrap();
            b.iter(|| {
                let done = Arc::new(AtomicUsize::new(0));
                for i in 0..TASKS {
                    let done = Arc::clone(&done);
                    pool.schedule(move || {
                        black_box(i);
                        done.fetch_add(1, Ordering::Release);
                    })
                    .unwrap();
                }
                assert!(wait_count(&done, TASKS, Duration::from_secs(30)));
            });
            pool.stop();
        });
    }

    group.finish();
}

/// Benchmark keyed scheduling: one serialized queue vs. many.
fn bench_keyed_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_keyed");
    group.throughput(Throughput::Elements(TASKS as u64));

    for tags in [1usize, 16] {
        group.bench_with_input(BenchmarkId::new("tags", tags), &tags, |b, &tags| {
            let pool = TaskPool::new();
            pool.start(4, 4).unwrap();
            let names: Vec<String> = (0..tags).map(|t| format!("store-{t}")).collect();
            b.iter(|| {
                let done = Arc::new(AtomicUsize::new(0));
                for i in 0..TASKS {
                    let done = Arc::clone(&done);
                    pool.schedule_keyed(names[i % tags].clone(), move || {
                        done.fetch_add(1, Ordering::Release);
                    })
                    .unwrap();
                }
                assert!(wait_count(&done, TASKS, Duration::from_secs(30)));
            });
            pool.stop();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_generic_tasks, bench_keyed_tasks);
criterion_main!(benches);
