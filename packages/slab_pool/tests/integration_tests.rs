//! Integration tests for the `slab_pool` package.
//!
//! These tests exercise `Pool` and `Block` through the public API only, including lease
//! balancing across threads, capacity limits and draining of deactivated slabs.

use std::sync::{Arc, Barrier};
use std::thread;

use slab_pool::{Error, OverflowPolicy, Pool};

#[test]
fn balanced_retain_release_across_threads() {
    const THREADS: usize = 8;
    const LEASES_PER_THREAD: usize = 100;

    let pool = Pool::builder().slab_size(4096).build();
    let block = pool.rent(256).unwrap();

    let leases = (0..THREADS * LEASES_PER_THREAD)
        .map(|_| block.retain().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(block.reference_count(), THREADS * LEASES_PER_THREAD + 1);

    let barrier = Arc::new(Barrier::new(THREADS));
    let mut leases = leases.into_iter();

    let releasers = (0..THREADS)
        .map(|_| {
            let batch = leases.by_ref().take(LEASES_PER_THREAD).collect::<Vec<_>>();
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                batch
                    .into_iter()
                    .map(slab_pool::Block::release)
                    .filter(|alive| !*alive)
                    .count()
            })
        })
        .collect::<Vec<_>>();

    let dead_count: usize = releasers
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .sum();

    // Our own lease was still held, so no release could free the block.
    assert_eq!(dead_count, 0);
    assert_eq!(block.reference_count(), 1);
    assert_eq!(pool.stats().leased_blocks, 1);

    assert!(!block.release());

    let stats = pool.stats();
    assert_eq!(stats.leased_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn pin_bounds() {
    let pool = Pool::new();
    let block = pool.rent(1000).unwrap();
    let len = block.len();

    for offset in 0..=len {
        assert!(block.pin(offset).is_ok());
    }

    assert!(matches!(
        block.pin(len + 1),
        Err(Error::OffsetOutOfRange { offset, length }) if offset == len + 1 && length == len
    ));
}

#[test]
fn reused_memory_is_not_zeroed() {
    let pool = Pool::builder().slab_size(4096).build();

    let mut block = pool.rent(512).unwrap();
    let offset = block.offset();
    block.as_mut_bytes().unwrap().fill(0xC3);
    drop(block);

    let block = pool.rent(512).unwrap();
    assert_eq!(block.offset(), offset);

    // Stale contents from the previous lease are expected; the pool does not promise zeroing.
    assert!(block.as_bytes().unwrap().iter().all(|b| *b == 0xC3));
}

#[test]
fn growth_then_drain() {
    let pool = Pool::builder().slab_size(4096).build();

    let blocks = (0..10)
        .map(|_| pool.rent(1024).unwrap())
        .collect::<Vec<_>>();

    let stats = pool.stats();
    assert!(stats.slab_count >= 2);
    assert_eq!(stats.leased_blocks, 10);

    // Deactivate everything while blocks are still leased; nothing is freed yet.
    pool.set_max_total_bytes(Some(0));
    pool.trim();

    let stats = pool.stats();
    assert_eq!(stats.active_slab_count, 0);
    assert!(stats.slab_count >= 2);
    assert_eq!(stats.leased_blocks, 10);

    drop(blocks);

    let stats = pool.stats();
    assert_eq!(stats.slab_count, 0);
    assert_eq!(stats.pooled_bytes, 0);
    assert_eq!(stats.leased_blocks, 0);
    assert_eq!(stats.free_blocks, 0);
}

#[test]
fn capacity_cap_is_never_exceeded() {
    let pool = Pool::builder()
        .slab_size(1024)
        .max_total_bytes(4096)
        .build();

    let blocks = (0..16)
        .map(|_| pool.rent(512).unwrap())
        .collect::<Vec<_>>();

    let stats = pool.stats();
    assert_eq!(stats.pooled_bytes, 4096);
    assert_eq!(stats.rents_carved, 8);
    assert_eq!(stats.rents_unpooled, 8);

    drop(blocks);

    // Further rents reuse free blocks instead of growing.
    let blocks = (0..8)
        .map(|_| pool.rent(512).unwrap())
        .collect::<Vec<_>>();

    let stats = pool.stats();
    assert_eq!(stats.pooled_bytes, 4096);
    assert_eq!(stats.rents_reused, 8);
    assert_eq!(stats.rents_unpooled, 8);

    drop(blocks);
}

#[test]
fn capacity_cap_with_fail_policy() {
    let pool = Pool::builder()
        .slab_size(4096)
        .max_total_bytes(4096)
        .overflow_policy(OverflowPolicy::Fail)
        .build();

    let blocks = (0..4)
        .map(|_| pool.rent(1024).unwrap())
        .collect::<Vec<_>>();

    let error = pool.rent(1024).unwrap_err();
    assert!(matches!(
        error,
        Error::CapacityExceeded {
            requested: 1024,
            max_total_bytes: 4096
        }
    ));

    // Requests larger than a slab are not governed by the capacity limit.
    let oversized = pool.rent(8192).unwrap();
    assert_eq!(oversized.len(), 8192);

    drop(blocks);
    assert!(pool.rent(1024).is_ok());
}

#[test]
fn capped_pool_serves_larger_size_class_after_small_blocks_return() {
    let pool = Pool::builder()
        .slab_size(1024)
        .max_total_bytes(1024)
        .overflow_policy(OverflowPolicy::Fail)
        .build();

    let small = (0..16).map(|_| pool.rent(64).unwrap()).collect::<Vec<_>>();
    drop(small);

    let stats = pool.stats();
    assert_eq!(stats.leased_blocks, 0);
    assert_eq!(stats.free_blocks, 16);

    let large = pool.rent(1024).unwrap();
    assert_eq!(large.len(), 1024);

    let stats = pool.stats();
    assert_eq!(stats.pooled_bytes, 1024);
    assert_eq!(stats.rents_rejected, 0);

    // The small blocks went away with their slab, so small rents now fail until space returns.
    assert!(matches!(
        pool.rent(64),
        Err(Error::CapacityExceeded { .. })
    ));

    drop(large);
    assert!(pool.rent(64).is_ok());
}

#[test]
fn raising_limit_allows_growth_again() {
    let pool = Pool::builder()
        .slab_size(1024)
        .max_total_bytes(1024)
        .overflow_policy(OverflowPolicy::Fail)
        .build();

    let first = pool.rent(1024).unwrap();
    assert!(pool.rent(1024).is_err());

    pool.set_max_total_bytes(None);
    assert_eq!(pool.max_total_bytes(), None);

    let second = pool.rent(1024).unwrap();
    assert_eq!(pool.stats().slab_count, 2);

    drop(first);
    drop(second);
}

#[test]
fn disposed_block_never_returns() {
    let pool = Pool::builder().slab_size(4096).build();

    let block = pool.rent(64).unwrap();
    let offset = block.offset();
    block.dispose();
    drop(block);

    assert_eq!(pool.stats().free_blocks, 0);

    let next = pool.rent(64).unwrap();
    assert_ne!(next.offset(), offset);
}

#[test]
fn retained_handle_sees_writes() {
    let pool = Pool::new();

    let mut block = pool.rent(64).unwrap();
    block.as_mut_bytes().unwrap()[..4].copy_from_slice(b"ping");

    let other = block.retain().unwrap();

    let reader = thread::spawn(move || other.as_bytes().unwrap()[..4].to_vec());
    assert_eq!(reader.join().unwrap(), b"ping");

    // The reader's lease is gone again, so exclusive access is available.
    assert!(block.as_mut_bytes().is_ok());
}

#[test]
fn mixed_workload_stress() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2000;

    let pool = Pool::builder()
        .slab_size(8192)
        .max_total_bytes(64 * 1024)
        .build();

    let barrier = Arc::new(Barrier::new(THREADS));

    let workers = (0..THREADS)
        .map(|thread_index| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let mut held = Vec::new();

                for iteration in 0..ITERATIONS {
                    let size = 64 + (iteration * 37 + thread_index * 101) % 4000;
                    let mut block = pool.rent(size).unwrap();
                    assert!(block.len() >= size);

                    let marker = u8::try_from((iteration + thread_index) % 251).unwrap();
                    block.as_mut_bytes().unwrap().fill(marker);

                    let pinned = block.pin(block.len() / 2).unwrap();
                    drop(pinned);

                    assert!(block.as_bytes().unwrap().iter().all(|b| *b == marker));

                    if iteration % 3 == 0 {
                        held.push(block);
                    }

                    if held.len() > 16 {
                        held.clear();
                    }

                    if thread_index == 0 && iteration % 500 == 0 {
                        pool.trim();
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.leased_blocks, 0);
    assert!(stats.pooled_bytes <= 64 * 1024);
}
