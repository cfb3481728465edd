use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::thread;

use tracing::debug;

use crate::metrics::SLAB_RELEASED_BYTES;
use crate::{Error, Result};

/// Alignment of the start of every slab. Matches a typical cache line so that blocks carved at
/// the start of a slab do not share a cache line with unrelated allocations.
const SLAB_ALIGNMENT: usize = 64;

/// Set while the slab offers new leases to the pool.
const ACTIVE: usize = 1 << (usize::BITS - 1);

/// Set once the backing memory has been returned to the allocator. Terminal.
const RELEASED: usize = 1 << (usize::BITS - 2);

/// The low bits of the state word hold the number of blocks currently leased from the slab.
const OWNED_COUNT_MASK: usize = RELEASED - 1;

/// One large allocation at a fixed address, logically divided into blocks that are leased out by
/// the pool.
///
/// The slab does not know which blocks exist, it only counts how many are currently leased
/// (`owned_block_count`). The count, the "active" flag and the "released" flag share one atomic
/// word, which makes every state transition a single compare-and-swap:
///
/// * A lease can only be taken while the slab is active.
/// * Retiring a lease at zero is a double release and leaves the state untouched.
/// * The backing memory is released by whichever transition first observes "inactive with zero
///   leases". Exactly one caller can win that transition, so the memory is released exactly once.
///
/// The memory never moves, so pointers into it stay valid for as long as any lease is held.
pub(crate) struct Slab {
    base_ptr: NonNull<u8>,

    len: usize,

    state: AtomicUsize,

    /// Offset of the first byte not yet carved into a block. Only ever grows.
    next_offset: AtomicUsize,

    /// Set for pooled slabs, which report their state changes to the pool.
    usage: Option<Arc<SlabUsage>>,
}

/// Counters that pooled slabs keep current as they change state, so the pool can check its
/// capacity without walking (or locking) its slab list.
#[derive(Debug, Default)]
pub(crate) struct SlabUsage {
    /// Bytes held by slabs whose memory has not been released.
    pooled_bytes: AtomicUsize,

    /// Active slabs with no leased blocks. Can briefly dip below zero while a lease and a retire
    /// race, so only treat it as a hint.
    idle_slabs: AtomicIsize,
}

impl SlabUsage {
    #[must_use]
    pub(crate) fn pooled_bytes(&self) -> usize {
        self.pooled_bytes.load(Ordering::Acquire)
    }

    /// Whether some active slab may have no leased blocks, i.e. could be released to make room.
    #[must_use]
    pub(crate) fn has_idle_slabs(&self) -> bool {
        self.idle_slabs.load(Ordering::Acquire) > 0
    }
}

impl Slab {
    /// Allocates an active slab of `len` bytes with no leases.
    ///
    /// If `usage` is given, the slab is counted in it until its memory is released.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub(crate) fn create(len: usize, usage: Option<Arc<SlabUsage>>) -> Result<Self> {
        let base_ptr = Self::allocate(len)?;

        if let Some(usage) = &usage {
            usage.pooled_bytes.fetch_add(len, Ordering::AcqRel);
            usage.idle_slabs.fetch_add(1, Ordering::AcqRel);
        }

        debug!(len, "allocated pooled slab");

        Ok(Self {
            base_ptr,
            len,
            state: AtomicUsize::new(ACTIVE),
            next_offset: AtomicUsize::new(0),
            usage,
        })
    }

    /// Allocates an inactive slab of `len` bytes that is already leasing one block covering the
    /// entire slab. The memory is released when that block is retired.
    ///
    /// This is how the pool serves requests that it will not serve from pooled memory.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub(crate) fn create_dedicated(len: usize) -> Result<Self> {
        let base_ptr = Self::allocate(len)?;

        debug!(len, "allocated dedicated slab");

        Ok(Self {
            base_ptr,
            len,
            state: AtomicUsize::new(1),
            next_offset: AtomicUsize::new(len),
            usage: None,
        })
    }

    fn allocate(len: usize) -> Result<NonNull<u8>> {
        assert!(len > 0, "slab must have a non-zero length");

        let layout = Self::layout(len).ok_or(Error::AllocationFailed { size: len })?;

        // SAFETY: The layout is valid and not zero-sized (guarded by assertion above).
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr).ok_or(Error::AllocationFailed { size: len })
    }

    fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, SLAB_ALIGNMENT).ok()
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) & ACTIVE != 0
    }

    #[must_use]
    pub(crate) fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) & RELEASED != 0
    }

    /// Number of blocks currently leased from this slab.
    #[must_use]
    pub(crate) fn owned_block_count(&self) -> usize {
        self.state.load(Ordering::Acquire) & OWNED_COUNT_MASK
    }

    /// Number of bytes at the end of the slab that have not yet been carved into blocks.
    #[must_use]
    pub(crate) fn remaining(&self) -> usize {
        self.len
            .saturating_sub(self.next_offset.load(Ordering::Acquire))
    }

    /// Takes a lease on one block of the slab. Fails if the slab is no longer active.
    #[must_use]
    pub(crate) fn try_lease(&self) -> bool {
        let transition = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & ACTIVE == 0 {
                    return None;
                }

                assert!(
                    state & OWNED_COUNT_MASK < OWNED_COUNT_MASK,
                    "slab lease count overflow"
                );

                Some(
                    state
                        .checked_add(1)
                        .expect("guarded by the overflow assertion above"),
                )
            });

        match transition {
            Ok(previous) => {
                if previous & OWNED_COUNT_MASK == 0 {
                    self.track_idle(false);
                }

                true
            }
            Err(_) => false,
        }
    }

    /// Carves a new `len`-byte block out of the unused tail of the slab and leases it,
    /// returning the offset of the block.
    ///
    /// Returns `None` if the slab is inactive or does not have enough room left.
    #[must_use]
    pub(crate) fn try_carve(&self, len: usize) -> Option<usize> {
        if !self.try_lease() {
            return None;
        }

        let reserved = self
            .next_offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                let end = offset.checked_add(len)?;
                (end <= self.len).then_some(end)
            });

        if let Ok(offset) = reserved {
            Some(offset)
        } else {
            self.retire_block()
                .expect("we took a lease above, so there is a lease to retire");
            None
        }
    }

    /// Returns one lease to the slab.
    ///
    /// Returns `true` if this call released the backing memory of the slab, which happens when
    /// the last lease of an inactive slab is retired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if the slab has no leases. The state is left untouched.
    pub(crate) fn retire_block(&self) -> Result<bool> {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let owned = state & OWNED_COUNT_MASK;

                if owned == 0 {
                    return None;
                }

                let mut new_state = state
                    .checked_sub(1)
                    .expect("guarded by the zero check above");

                if owned == 1 && state & ACTIVE == 0 {
                    new_state |= RELEASED;
                }

                Some(new_state)
            })
            .map_err(|_state| Error::DoubleRelease)?;

        let released = previous & OWNED_COUNT_MASK == 1 && previous & ACTIVE == 0;

        if previous & OWNED_COUNT_MASK == 1 && previous & ACTIVE != 0 {
            self.track_idle(true);
        }

        if released {
            self.release_memory();
        }

        Ok(released)
    }

    /// Stops the slab from offering new leases. Blocks already leased stay valid until retired.
    ///
    /// Returns `true` if this call released the backing memory of the slab, which happens when
    /// the slab has no leases at the time it is deactivated.
    pub(crate) fn deactivate(&self) -> bool {
        let transition = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & ACTIVE == 0 {
                    return None;
                }

                let mut new_state = state & !ACTIVE;

                if new_state & OWNED_COUNT_MASK == 0 {
                    new_state |= RELEASED;
                }

                Some(new_state)
            });

        let released = matches!(transition, Ok(previous) if previous & OWNED_COUNT_MASK == 0);

        debug!(len = self.len, released, "deactivated slab");

        if released {
            self.track_idle(false);
            self.release_memory();
        }

        released
    }

    /// Pointer to the byte at `offset` in the slab. `offset` may be one past the end.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is beyond the end of the slab.
    #[must_use]
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset <= self.len,
            "offset {offset} out of bounds in slab of {} bytes",
            self.len
        );

        // SAFETY: Guarded by bounds check above. One past the end is a valid pointer to compute.
        unsafe { self.base_ptr.add(offset) }
    }

    /// Only called by the single winner of the transition that sets `RELEASED`.
    fn release_memory(&self) {
        let layout = Self::layout(self.len).expect("layout was valid when the slab was allocated");

        // SAFETY: The layout matches the one used for allocation. The caller won the transition
        // to `RELEASED`, so nobody else deallocates, and with zero leases on an inactive slab no
        // block can access the memory ever again.
        unsafe {
            dealloc(self.base_ptr.as_ptr(), layout);
        }

        if let Some(usage) = &self.usage {
            usage.pooled_bytes.fetch_sub(self.len, Ordering::AcqRel);
        }

        SLAB_RELEASED_BYTES.with(|event| event.observe(self.len));
        debug!(len = self.len, "released slab memory");
    }

    /// Records that the slab started or stopped being an active slab without leases.
    fn track_idle(&self, idle: bool) {
        let Some(usage) = &self.usage else {
            return;
        };

        if idle {
            usage.idle_slabs.fetch_add(1, Ordering::AcqRel);
        } else {
            usage.idle_slabs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let state = *self.state.get_mut();

        // Blocks keep their slab alive, so a slab can only be dropped without leases.
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was.
        if !thread::panicking() {
            assert!(
                state & OWNED_COUNT_MASK == 0,
                "dropped a slab that still has {} leased blocks",
                state & OWNED_COUNT_MASK
            );
        }

        if state & RELEASED == 0 {
            *self.state.get_mut() = state | RELEASED;

            if state & ACTIVE != 0 && state & OWNED_COUNT_MASK == 0 {
                self.track_idle(false);
            }

            self.release_memory();
        }
    }
}

impl fmt::Debug for Slab {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("base_ptr", &self.base_ptr)
            .field("len", &self.len)
            .field("is_active", &self.is_active())
            .field("is_released", &self.is_released())
            .field("owned_block_count", &self.owned_block_count())
            .field("remaining", &self.remaining())
            .finish()
    }
}

// SAFETY: The slab is a plain byte buffer plus atomics. Which thread may touch which bytes is
// governed by the leases handed out through the atomic state, not by the slab itself.
unsafe impl Send for Slab {}

// SAFETY: All shared state is atomic. The slab never creates references to its memory.
unsafe impl Sync for Slab {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn smoke_test() {
        let slab = Slab::create(4096, None).unwrap();

        assert_eq!(slab.len(), 4096);
        assert!(slab.is_active());
        assert!(!slab.is_released());
        assert_eq!(slab.owned_block_count(), 0);
        assert_eq!(slab.remaining(), 4096);

        assert_eq!(slab.try_carve(1024), Some(0));
        assert_eq!(slab.try_carve(1024), Some(1024));

        assert_eq!(slab.owned_block_count(), 2);
        assert_eq!(slab.remaining(), 2048);

        assert!(!slab.retire_block().unwrap());
        assert!(!slab.retire_block().unwrap());
        assert_eq!(slab.owned_block_count(), 0);
    }

    #[test]
    fn carve_fails_when_out_of_room() {
        let slab = Slab::create(1024, None).unwrap();

        assert_eq!(slab.try_carve(1024), Some(0));
        assert_eq!(slab.try_carve(64), None);

        // The failed carve must not leave a lease behind.
        assert_eq!(slab.owned_block_count(), 1);

        slab.retire_block().unwrap();
    }

    #[test]
    fn carve_from_inactive_slab_is_rejected() {
        let slab = Slab::create(1024, None).unwrap();
        let ptr = slab.ptr_at(0);
        assert_eq!(slab.try_carve(64), Some(0));

        assert!(!slab.deactivate());

        assert_eq!(slab.try_carve(64), None);
        assert!(!slab.try_lease());
        assert_eq!(slab.owned_block_count(), 1);

        // The outstanding block can still use its memory.
        // SAFETY: The slab is still leasing the block at offset 0, so the memory is alive.
        unsafe {
            ptr.write(0xAB);
        }

        assert!(slab.retire_block().unwrap());
        assert!(slab.is_released());
    }

    #[test]
    fn retire_without_lease_is_double_release() {
        let slab = Slab::create(1024, None).unwrap();

        assert!(matches!(slab.retire_block(), Err(Error::DoubleRelease)));
        assert_eq!(slab.owned_block_count(), 0);

        assert_eq!(slab.try_carve(64), Some(0));
        assert!(!slab.retire_block().unwrap());
        assert!(matches!(slab.retire_block(), Err(Error::DoubleRelease)));

        // The failed release did not wrap the count around.
        assert_eq!(slab.owned_block_count(), 0);
        assert!(slab.is_active());
    }

    #[test]
    fn deactivate_empty_slab_releases_immediately() {
        let slab = Slab::create(1024, None).unwrap();

        assert!(slab.deactivate());
        assert!(slab.is_released());

        // Deactivating again is a no-op.
        assert!(!slab.deactivate());
    }

    #[test]
    fn active_slab_is_not_released_when_drained() {
        let slab = Slab::create(1024, None).unwrap();

        assert_eq!(slab.try_carve(64), Some(0));
        assert!(!slab.retire_block().unwrap());

        assert!(!slab.is_released());
        assert!(slab.is_active());
    }

    #[test]
    fn dedicated_slab_releases_with_its_block() {
        let slab = Slab::create_dedicated(100_000).unwrap();

        assert!(!slab.is_active());
        assert_eq!(slab.owned_block_count(), 1);
        assert_eq!(slab.remaining(), 0);
        assert!(!slab.try_lease());

        assert!(slab.retire_block().unwrap());
        assert!(slab.is_released());
    }

    #[test]
    fn usage_tracks_pooled_bytes_and_idle_slabs() {
        let usage = Arc::new(SlabUsage::default());

        let first = Slab::create(1024, Some(Arc::clone(&usage))).unwrap();
        let second = Slab::create(2048, Some(Arc::clone(&usage))).unwrap();

        assert_eq!(usage.pooled_bytes(), 3072);
        assert!(usage.has_idle_slabs());

        assert_eq!(first.try_carve(64), Some(0));
        assert_eq!(second.try_carve(64), Some(0));
        assert!(!usage.has_idle_slabs());

        // A second lease on a busy slab does not change anything.
        assert_eq!(first.try_carve(64), Some(64));
        first.retire_block().unwrap();
        assert!(!usage.has_idle_slabs());

        first.retire_block().unwrap();
        assert!(usage.has_idle_slabs());

        assert!(first.deactivate());
        assert!(!usage.has_idle_slabs());
        assert_eq!(usage.pooled_bytes(), 2048);

        // Draining slabs still count as pooled until their last block is retired.
        assert!(!second.deactivate());
        assert_eq!(usage.pooled_bytes(), 2048);

        assert!(second.retire_block().unwrap());
        assert_eq!(usage.pooled_bytes(), 0);
        assert!(!usage.has_idle_slabs());
    }

    #[test]
    fn dropping_idle_slab_updates_usage() {
        let usage = Arc::new(SlabUsage::default());

        let slab = Slab::create(1024, Some(Arc::clone(&usage))).unwrap();
        assert!(usage.has_idle_slabs());

        drop(slab);

        assert_eq!(usage.pooled_bytes(), 0);
        assert!(!usage.has_idle_slabs());
    }

    #[test]
    fn oversized_layout_is_allocation_failure() {
        let result = Slab::create(usize::MAX, None);

        assert!(matches!(
            result,
            Err(Error::AllocationFailed { size: usize::MAX })
        ));
    }

    #[test]
    #[should_panic]
    fn zero_length_is_panic() {
        drop(Slab::create(0, None));
    }

    #[test]
    #[should_panic]
    fn ptr_at_out_of_bounds_panics() {
        let slab = Slab::create(64, None).unwrap();
        _ = slab.ptr_at(65);
    }

    #[test]
    fn concurrent_last_retire_releases_exactly_once() {
        const THREADS: usize = 16;
        const ROUNDS: usize = 50;

        for _ in 0..ROUNDS {
            let slab = Arc::new(Slab::create(THREADS * 64, None).unwrap());

            for _ in 0..THREADS {
                assert!(slab.try_carve(64).is_some());
            }

            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let retirers = (0..THREADS)
                .map(|_| {
                    let slab = Arc::clone(&slab);
                    let barrier = Arc::clone(&barrier);

                    thread::spawn(move || {
                        barrier.wait();
                        slab.retire_block().unwrap()
                    })
                })
                .collect::<Vec<_>>();

            barrier.wait();
            let deactivate_released = slab.deactivate();

            let retire_releases = retirers
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|released| *released)
                .count();

            let total_releases = retire_releases + usize::from(deactivate_released);
            assert_eq!(total_releases, 1);
            assert!(slab.is_released());
            assert_eq!(slab.owned_block_count(), 0);
        }
    }

    #[test]
    fn concurrent_carving_never_overlaps() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;

        let slab = Arc::new(Slab::create(THREADS * PER_THREAD * 64, None).unwrap());

        let carvers = (0..THREADS)
            .map(|_| {
                let slab = Arc::clone(&slab);

                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| slab.try_carve(64).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut offsets = carvers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();

        offsets.sort_unstable();
        offsets.dedup();

        assert_eq!(offsets.len(), THREADS * PER_THREAD);
        assert_eq!(slab.remaining(), 0);
        assert_eq!(slab.owned_block_count(), THREADS * PER_THREAD);

        for _ in 0..THREADS * PER_THREAD {
            slab.retire_block().unwrap();
        }
    }
}
