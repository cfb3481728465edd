use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::{
    RENT_CARVED, RENT_REJECTED, RENT_REUSED, RENT_SIZE_BYTES, RENT_UNPOOLED, SLAB_ALLOCATED_BYTES,
};
use crate::{
    Block, BlockCore, Error, OverflowPolicy, PoolBuilder, PoolStats, Result, Slab, SlabUsage,
};

/// The smallest block the pool hands out. Smaller requests are rounded up to this size.
pub const MIN_BLOCK_SIZE: usize = 64;

/// The slab size used by [`Pool::new()`].
pub const DEFAULT_SLAB_SIZE: usize = 64 * 1024;

/// Stored in place of "no capacity limit".
const UNLIMITED: usize = usize::MAX;

/// A pool of byte buffers ("blocks") carved from large pinned allocations ("slabs").
///
/// Renting a block returns a [`Block`] lease. When every lease on a block has been released, the
/// block goes back on a free list and is handed out again by a later rent. Requests are rounded
/// up to a power-of-two size class of at least [`MIN_BLOCK_SIZE`] bytes; each size class has its
/// own free list. The contents of a rented block are whatever the previous user left behind.
///
/// The pool grows one slab at a time, all slabs having the configured slab size. Growth can be
/// bounded by a capacity limit, in which case requests that do not fit are handled according to
/// the [`OverflowPolicy`] of the pool. Requests larger than a slab never use pooled memory.
///
/// # Resource usage
///
/// The pool never frees memory that is still leased. To reduce memory usage, the pool
/// deactivates slabs: a deactivated slab hands out no new blocks and its memory is released as
/// soon as its last outstanding block is released. See [`trim()`][1] and [`shrink_to_fit()`][2].
///
/// Blocks may outlive the pool. Dropping the last handle to the pool deactivates all slabs.
///
/// # Thread safety
///
/// The pool is [`Send`] and [`Sync`] and cloning it produces another handle to the same pool.
/// Renting and releasing blocks is lock-free except when a new slab must be allocated, or idle
/// slabs released to make room for one.
///
/// # Examples
///
/// ```
/// use slab_pool::Pool;
///
/// let pool = Pool::builder().slab_size(4096).build();
///
/// let mut block = pool.rent(1000)?;
/// assert_eq!(block.len(), 1024);
///
/// block.as_mut_bytes()?.fill(0xFF);
/// drop(block);
///
/// // The same region is reused for the next request of the same size class.
/// let block = pool.rent(1024)?;
/// assert_eq!(pool.stats().rents_reused, 1);
/// # drop(block);
/// # Ok::<(), slab_pool::Error>(())
/// ```
///
/// [1]: Self::trim
/// [2]: Self::shrink_to_fit
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

/// The state shared by all handles to a pool. Blocks refer to it weakly.
pub(crate) struct PoolShared {
    slab_size: usize,

    /// `UNLIMITED` if there is no limit.
    max_total_bytes: AtomicUsize,

    overflow_policy: OverflowPolicy,

    /// One lock-free queue per size class, from `MIN_BLOCK_SIZE` up to the largest power of two
    /// that fits in a slab.
    free_lists: Box<[SegQueue<Arc<BlockCore>>]>,

    /// The slab that new blocks are carved from, if any.
    current_slab: ArcSwapOption<Slab>,

    /// Every pooled slab whose memory has not been released yet (as of the last pruning).
    /// The lock is only taken to grow, trim or inspect the pool.
    slabs: Mutex<Vec<Arc<Slab>>>,

    /// Kept current by the pooled slabs themselves, so capacity checks need no lock.
    usage: Arc<SlabUsage>,

    rents_reused: AtomicU64,
    rents_carved: AtomicU64,
    rents_unpooled: AtomicU64,
    rents_rejected: AtomicU64,
}

impl Pool {
    pub(crate) fn new_inner(
        slab_size: usize,
        max_total_bytes: Option<usize>,
        overflow_policy: OverflowPolicy,
    ) -> Self {
        let size_class_count = size_class_index(largest_size_class(slab_size))
            .checked_add(1)
            .expect("size class count is tiny");

        let free_lists = (0..size_class_count)
            .map(|_| SegQueue::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shared: Arc::new(PoolShared {
                slab_size,
                max_total_bytes: AtomicUsize::new(max_total_bytes.unwrap_or(UNLIMITED)),
                overflow_policy,
                free_lists,
                current_slab: ArcSwapOption::empty(),
                slabs: Mutex::new(Vec::new()),
                usage: Arc::new(SlabUsage::default()),
                rents_reused: AtomicU64::new(0),
                rents_carved: AtomicU64::new(0),
                rents_unpooled: AtomicU64::new(0),
                rents_rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a new [`Pool`] with the default configuration.
    ///
    /// The pool starts empty and allocates slabs of [`DEFAULT_SLAB_SIZE`] bytes as needed,
    /// without a capacity limit.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slab_pool::Pool;
    ///
    /// let pool = Pool::new();
    ///
    /// assert_eq!(pool.stats().slab_count, 0);
    ///
    /// let block = pool.rent(10)?;
    /// assert_eq!(pool.stats().slab_count, 1);
    /// # drop(block);
    /// # Ok::<(), slab_pool::Error>(())
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a new [`Pool`].
    ///
    /// Use this when you want to customize the pool configuration beyond the defaults.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// The size in bytes of every pooled slab.
    #[must_use]
    pub fn slab_size(&self) -> usize {
        self.shared.slab_size
    }

    /// The maximum number of bytes of pooled slab memory, if limited.
    #[must_use]
    pub fn max_total_bytes(&self) -> Option<usize> {
        match self.shared.max_total_bytes.load(Ordering::Relaxed) {
            UNLIMITED => None,
            limit => Some(limit),
        }
    }

    /// How requests are served once the pool has reached its capacity limit.
    #[must_use]
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.shared.overflow_policy
    }

    /// Changes the capacity limit of the pool.
    ///
    /// The new limit applies to future growth immediately. To bring the memory already held by
    /// the pool in line with a lower limit, call [`trim()`][Self::trim].
    pub fn set_max_total_bytes(&self, max_total_bytes: Option<usize>) {
        self.shared
            .max_total_bytes
            .store(max_total_bytes.unwrap_or(UNLIMITED), Ordering::Relaxed);
    }

    /// Rents a block of at least `min_size` bytes.
    ///
    /// The request is served, in order of preference, by reusing a free block of the same size
    /// class, by carving a new block from the current slab or by allocating a new slab. The
    /// returned block holds the first lease on its memory. Its contents are unspecified.
    ///
    /// If a new slab would exceed the capacity limit, slabs that have no leased blocks are
    /// released first. Only if that does not make room does the [`OverflowPolicy`] apply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if new memory was needed and could not be allocated,
    /// and [`Error::CapacityExceeded`] if the capacity limit has been reached and the pool uses
    /// [`OverflowPolicy::Fail`].
    pub fn rent(&self, min_size: usize) -> Result<Block> {
        RENT_SIZE_BYTES.with(|event| event.observe(min_size));

        let Some(class_size) = self.shared.size_class(min_size) else {
            trace!(min_size, "rent does not fit in a slab");
            return self.rent_unpooled(min_size);
        };

        if let Some(block) = self.try_rent_pooled(class_size) {
            return Ok(block);
        }

        // Only take the growth lock if growing is possible, either right away or after releasing
        // slabs that sit idle on the free lists.
        let max_total_bytes = self.shared.max_total_bytes.load(Ordering::Relaxed);

        if !self.shared.has_room_for_slab(max_total_bytes) && !self.shared.usage.has_idle_slabs() {
            return self.rent_over_capacity(min_size, max_total_bytes);
        }

        self.grow_and_rent(min_size, class_size)
    }

    /// Serves a rent from the free list or the current slab, without taking the growth lock.
    fn try_rent_pooled(&self, class_size: usize) -> Option<Block> {
        if let Some(core) = self.shared.pop_free(class_size) {
            self.shared.rents_reused.fetch_add(1, Ordering::Relaxed);
            RENT_REUSED.with(|event| event.observe_once());
            trace!(class_size, "rent served from free list");
            return Some(Block::from_core(core));
        }

        let slab = self.shared.current_slab.load_full()?;
        let offset = slab.try_carve(class_size)?;

        self.shared.rents_carved.fetch_add(1, Ordering::Relaxed);
        RENT_CARVED.with(|event| event.observe_once());
        trace!(class_size, offset, "rent carved from current slab");

        Some(Block::from_core(BlockCore::new_leased(
            slab,
            offset,
            class_size,
            Arc::downgrade(&self.shared),
        )))
    }

    fn grow_and_rent(&self, min_size: usize, class_size: usize) -> Result<Block> {
        let mut slabs = self.shared.slabs.lock();

        // Another thread may have grown the pool or returned a block while we waited.
        if let Some(block) = self.try_rent_pooled(class_size) {
            return Ok(block);
        }

        slabs.retain(|slab| !slab.is_released());

        let max_total_bytes = self.shared.max_total_bytes.load(Ordering::Relaxed);

        if !self.shared.has_room_for_slab(max_total_bytes) {
            // Free blocks belong to one size class forever. Slabs holding nothing but free blocks
            // are released so their bytes can back a slab for the size class in demand.
            let reclaimed = deactivate_idle(&slabs);

            if reclaimed > 0 {
                debug!(reclaimed, max_total_bytes, "released idle slabs to make room");
                self.shared.forget_inactive(&mut slabs);
            }

            if !self.shared.has_room_for_slab(max_total_bytes) {
                drop(slabs);
                return self.rent_over_capacity(min_size, max_total_bytes);
            }
        }

        let slab = Arc::new(Slab::create(
            self.shared.slab_size,
            Some(Arc::clone(&self.shared.usage)),
        )?);

        SLAB_ALLOCATED_BYTES.with(|event| event.observe(self.shared.slab_size));
        debug!(
            slab_size = self.shared.slab_size,
            slab_count = slabs.len().saturating_add(1),
            "pool grew by one slab"
        );

        let offset = slab
            .try_carve(class_size)
            .expect("a new slab is active and every size class fits in a slab");

        self.shared.current_slab.store(Some(Arc::clone(&slab)));
        slabs.push(Arc::clone(&slab));

        self.shared.rents_carved.fetch_add(1, Ordering::Relaxed);
        RENT_CARVED.with(|event| event.observe_once());

        Ok(Block::from_core(BlockCore::new_leased(
            slab,
            offset,
            class_size,
            Arc::downgrade(&self.shared),
        )))
    }

    fn rent_over_capacity(&self, min_size: usize, max_total_bytes: usize) -> Result<Block> {
        match self.shared.overflow_policy {
            OverflowPolicy::AllocateUnpooled => {
                trace!(min_size, max_total_bytes, "pool at capacity");
                self.rent_unpooled(min_size)
            }
            OverflowPolicy::Fail => {
                self.shared.rents_rejected.fetch_add(1, Ordering::Relaxed);
                RENT_REJECTED.with(|event| event.observe(min_size));
                debug!(min_size, max_total_bytes, "rejected rent, pool at capacity");

                Err(Error::CapacityExceeded {
                    requested: min_size,
                    max_total_bytes,
                })
            }
        }
    }

    fn rent_unpooled(&self, min_size: usize) -> Result<Block> {
        let len = min_size.max(MIN_BLOCK_SIZE);
        let slab = Arc::new(Slab::create_dedicated(len)?);

        self.shared.rents_unpooled.fetch_add(1, Ordering::Relaxed);
        RENT_UNPOOLED.with(|event| event.observe_once());

        // The slab is inactive from the start, so the block never returns to the pool.
        Ok(Block::from_core(BlockCore::new_leased(
            slab,
            0,
            len,
            Weak::new(),
        )))
    }

    /// Brings the pool within its capacity limit.
    ///
    /// If the active slabs hold more bytes than the limit allows (e.g. after lowering the limit
    /// via [`set_max_total_bytes()`][Self::set_max_total_bytes]), slabs are deactivated until
    /// the rest fits, preferring slabs with the fewest outstanding blocks. A deactivated slab
    /// hands out no new blocks and releases its memory once its outstanding blocks have been
    /// released. Memory in use is never freed.
    ///
    /// Free blocks of deactivated slabs are disposed and slabs whose memory has been released are
    /// forgotten.
    pub fn trim(&self) {
        let mut slabs = self.shared.slabs.lock();
        slabs.retain(|slab| !slab.is_released());

        let max_total_bytes = self.shared.max_total_bytes.load(Ordering::Relaxed);

        let mut active = slabs
            .iter()
            .filter(|slab| slab.is_active())
            .collect::<Vec<_>>();

        let mut active_bytes = pooled_bytes(active.iter().copied());

        if active_bytes > max_total_bytes {
            active.sort_by_key(|slab| slab.owned_block_count());

            for slab in active {
                if active_bytes <= max_total_bytes {
                    break;
                }

                slab.deactivate();
                active_bytes = active_bytes.saturating_sub(slab.len());
            }

            debug!(active_bytes, max_total_bytes, "trimmed pool");
        }

        self.shared.forget_inactive(&mut slabs);
    }

    /// Deactivates every slab that has no outstanding blocks, releasing its memory.
    ///
    /// Slabs with outstanding blocks are left untouched and continue to be used by the pool.
    pub fn shrink_to_fit(&self) {
        let mut slabs = self.shared.slabs.lock();

        deactivate_idle(&slabs);

        self.shared.forget_inactive(&mut slabs);
    }

    /// A snapshot of the state of the pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use slab_pool::Pool;
    ///
    /// let pool = Pool::builder().slab_size(4096).build();
    ///
    /// let blocks = (0..5).map(|_| pool.rent(1024)).collect::<Result<Vec<_>, _>>()?;
    ///
    /// let stats = pool.stats();
    /// assert_eq!(stats.slab_count, 2);
    /// assert_eq!(stats.pooled_bytes, 8192);
    /// assert_eq!(stats.leased_blocks, 5);
    ///
    /// drop(blocks);
    /// assert_eq!(pool.stats().free_blocks, 5);
    /// # Ok::<(), slab_pool::Error>(())
    /// ```
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let slabs = self.shared.slabs.lock();

        let live = slabs
            .iter()
            .filter(|slab| !slab.is_released())
            .collect::<Vec<_>>();

        PoolStats {
            slab_count: live.len(),
            active_slab_count: live.iter().filter(|slab| slab.is_active()).count(),
            pooled_bytes: pooled_bytes(live.iter().copied()),
            leased_blocks: live.iter().map(|slab| slab.owned_block_count()).sum(),
            free_blocks: self.shared.free_lists.iter().map(SegQueue::len).sum(),
            rents_reused: self.shared.rents_reused.load(Ordering::Relaxed),
            rents_carved: self.shared.rents_carved.load(Ordering::Relaxed),
            rents_unpooled: self.shared.rents_unpooled.load(Ordering::Relaxed),
            rents_rejected: self.shared.rents_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("slab_size", &self.slab_size())
            .field("max_total_bytes", &self.max_total_bytes())
            .field("overflow_policy", &self.overflow_policy())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolShared {
    /// Whether one more slab fits within `max_total_bytes`.
    fn has_room_for_slab(&self, max_total_bytes: usize) -> bool {
        self.usage
            .pooled_bytes()
            .checked_add(self.slab_size)
            .is_some_and(|total| total <= max_total_bytes)
    }

    /// The size class for a request, or `None` if the request does not fit in a slab.
    fn size_class(&self, size: usize) -> Option<usize> {
        let class_size = size.max(MIN_BLOCK_SIZE).checked_next_power_of_two()?;
        (class_size <= self.slab_size).then_some(class_size)
    }

    fn free_list(&self, class_size: usize) -> &SegQueue<Arc<BlockCore>> {
        self.free_lists
            .get(size_class_index(class_size))
            .expect("size classes are bounded by the slab size")
    }

    fn pop_free(&self, class_size: usize) -> Option<Arc<BlockCore>> {
        let free_list = self.free_list(class_size);

        while let Some(core) = free_list.pop() {
            if core.try_lease() {
                return Some(core);
            }

            // The slab of the block was deactivated while the block waited on the free list.
            core.dispose();
        }

        None
    }

    /// Called by a pooled block when its last lease has been released.
    pub(crate) fn return_to_free_list(&self, core: Arc<BlockCore>) {
        let class_size = self
            .size_class(core.len())
            .expect("pooled blocks always have the length of a size class");

        self.free_list(class_size).push(core);
    }

    /// Stops carving from an inactive current slab, disposes free blocks of inactive slabs and
    /// forgets slabs whose memory has been released.
    fn forget_inactive(&self, slabs: &mut Vec<Arc<Slab>>) {
        if self
            .current_slab
            .load_full()
            .is_some_and(|slab| !slab.is_active())
        {
            self.current_slab.store(None);
        }

        for free_list in self.free_lists.iter() {
            // Only look at the blocks present now, so concurrent returns cannot keep us here.
            let mut keep = Vec::with_capacity(free_list.len());

            for _ in 0..free_list.len() {
                let Some(core) = free_list.pop() else {
                    break;
                };

                if core.slab().is_active() {
                    keep.push(core);
                } else {
                    core.dispose();
                }
            }

            for core in keep {
                free_list.push(core);
            }
        }

        slabs.retain(|slab| !slab.is_released());
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Outstanding blocks keep their slabs alive. Deactivating makes each slab release its
        // memory as soon as its last block comes back, instead of parking it on our free list.
        for slab in self.slabs.get_mut().iter() {
            slab.deactivate();
        }
    }
}

impl fmt::Debug for PoolShared {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("slab_size", &self.slab_size)
            .field("overflow_policy", &self.overflow_policy)
            .finish_non_exhaustive()
    }
}

/// Deactivates every active slab without leased blocks, releasing its memory. Returns how many
/// slabs were released.
fn deactivate_idle(slabs: &[Arc<Slab>]) -> usize {
    slabs
        .iter()
        .filter(|slab| slab.is_active() && slab.owned_block_count() == 0)
        .filter(|slab| slab.deactivate())
        .count()
}

fn pooled_bytes<'a>(slabs: impl IntoIterator<Item = &'a Arc<Slab>>) -> usize {
    slabs
        .into_iter()
        .filter(|slab| !slab.is_released())
        .map(|slab| slab.len())
        .fold(0, usize::saturating_add)
}

/// The largest power of two not exceeding `slab_size`.
fn largest_size_class(slab_size: usize) -> usize {
    let highest_bit = usize::BITS
        .checked_sub(1)
        .and_then(|bits| bits.checked_sub(slab_size.leading_zeros()))
        .expect("slab size is non-zero");

    1 << highest_bit
}

/// Position of a size class in the free list array. The smallest class is at index 0.
fn size_class_index(class_size: usize) -> usize {
    debug_assert!(class_size.is_power_of_two());

    let index = class_size
        .trailing_zeros()
        .checked_sub(MIN_BLOCK_SIZE.trailing_zeros())
        .expect("size classes are never smaller than the minimum block size");

    usize::try_from(index).expect("a bit index always fits in usize")
}
