//! Basic benchmarks for the `slab_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use slab_pool::Pool;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BLOCK_SIZE: usize = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("slab_pool_basic");

    group.bench_function("build_empty", |b| {
        b.iter(|| drop(black_box(Pool::new())));
    });

    group.bench_function("rent_first", |b| {
        b.iter_custom(|iters| {
            let pools = iter::repeat_with(Pool::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &pools {
                drop(black_box(pool.rent(black_box(BLOCK_SIZE)).unwrap()));
            }

            start.elapsed()
        });
    });

    group.bench_function("rent_reused", |b| {
        let pool = Pool::new();

        // Pre-warm the free list with one block.
        drop(pool.rent(BLOCK_SIZE).unwrap());

        b.iter(|| {
            drop(black_box(pool.rent(black_box(BLOCK_SIZE)).unwrap()));
        });
    });

    group.bench_function("retain_release", |b| {
        let pool = Pool::new();
        let block = pool.rent(BLOCK_SIZE).unwrap();

        b.iter(|| {
            let lease = black_box(&block).retain().unwrap();
            black_box(lease.release());
        });
    });

    group.bench_function("pin", |b| {
        let pool = Pool::new();
        let block = pool.rent(BLOCK_SIZE).unwrap();

        b.iter(|| {
            drop(black_box(block.pin(black_box(16)).unwrap()));
        });
    });

    group.finish();
}
