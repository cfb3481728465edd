use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use tracing::error;

use crate::{Error, PoolShared, RawHandle, Result, Slab};

/// Bookkeeping for one region of a slab, shared by all leases on the region.
///
/// The core outlives individual leases: when the reference count drops to zero the core is parked
/// on the free list of the pool and leased again by a later rent.
pub(crate) struct BlockCore {
    slab: Arc<Slab>,

    offset: usize,
    len: usize,

    /// Number of leases. Zero means the block is free (on the free list or being dropped).
    reference_count: AtomicUsize,

    disposed: AtomicBool,

    /// The pool the block returns to. The block does not keep the pool alive.
    pool: Weak<PoolShared>,
}

impl BlockCore {
    /// Creates the core for a region of `slab` that the caller has already leased from the slab.
    /// The core starts with one lease.
    ///
    /// # Panics
    ///
    /// Panics if the region does not fit in the slab.
    pub(crate) fn new_leased(
        slab: Arc<Slab>,
        offset: usize,
        len: usize,
        pool: Weak<PoolShared>,
    ) -> Arc<Self> {
        let end = offset
            .checked_add(len)
            .expect("block range must not overflow the address space");

        assert!(
            end <= slab.len(),
            "block [{offset}, {end}) does not fit in slab of {} bytes",
            slab.len()
        );

        Arc::new(Self {
            slab,
            offset,
            len,
            reference_count: AtomicUsize::new(1),
            disposed: AtomicBool::new(false),
            pool,
        })
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    #[must_use]
    pub(crate) fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub(crate) fn slab(&self) -> &Slab {
        &self.slab
    }

    /// Takes the first lease on a free block, as done by the pool when reusing a block from the
    /// free list. Fails if the block is disposed, if its slab no longer issues leases or if the
    /// block is not free.
    #[must_use]
    pub(crate) fn try_lease(&self) -> bool {
        if self.is_disposed() || !self.slab.try_lease() {
            return false;
        }

        if self
            .reference_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }

        // Someone else holds a lease on a block that was supposed to be free. Give back the slab
        // lease we took and refuse to hand out the block a second time.
        if let Err(e) = self.slab.retire_block() {
            report_accounting_defect(&e);
        }

        report_accounting_defect(&Error::DoubleRelease);
        false
    }

    /// Adds a lease to a block that already has at least one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the block is disposed or has no leases left to share.
    pub(crate) fn retain(&self) -> Result<()> {
        let mut current = self.reference_count.load(Ordering::Acquire);

        loop {
            // A block at zero may already be back on the free list; resurrecting it from a stale
            // handle would hand the same memory to two owners.
            if current == 0 || self.is_disposed() {
                return Err(Error::Disposed);
            }

            let next = current
                .checked_add(1)
                .expect("block reference count overflow");

            match self.reference_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Removes a lease. Returns whether the block is still alive (has leases left).
    ///
    /// The transition from one lease to zero hands the block back to its slab and, unless the
    /// block is disposed or its slab is draining, to the free list of the pool.
    ///
    /// Releasing is permitted on disposed blocks, so that the leases outstanding at the time of
    /// disposal can still drain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if the block has no leases. The count is left untouched.
    pub(crate) fn release(self: &Arc<Self>) -> Result<bool> {
        let mut current = self.reference_count.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return Err(Error::DoubleRelease);
            }

            let next = current
                .checked_sub(1)
                .expect("guarded by the zero check above");

            match self.reference_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            self.on_zero_references();
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Runs exactly once per transition of the reference count from one to zero.
    fn on_zero_references(self: &Arc<Self>) {
        if let Err(e) = self.slab.retire_block() {
            report_accounting_defect(&e);
            return;
        }

        if self.is_disposed() || !self.slab.is_active() {
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.return_to_free_list(Arc::clone(self));
        }
    }

    /// Marks the block as permanently retired. It will not be leased, retained or accessed again
    /// and does not return to the free list once its remaining leases are released.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn ptr_at(&self, byte_offset: usize) -> NonNull<u8> {
        let offset = self
            .offset
            .checked_add(byte_offset)
            .expect("guarded by block bounds check");

        self.slab.ptr_at(offset)
    }
}

impl fmt::Debug for BlockCore {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCore")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("reference_count", &self.reference_count())
            .field("disposed", &self.is_disposed())
            .field("slab", &self.slab)
            .finish_non_exhaustive()
    }
}

/// Accounting defects mean lease handling has a bug somewhere. They are never silently ignored:
/// debug builds panic, release builds log the defect and reject the operation.
#[cfg_attr(test, mutants::skip)] // Mutating this only hides defects, it cannot be observed.
pub(crate) fn report_accounting_defect(error: &Error) {
    error!(%error, "block lease accounting defect");

    // Never panic while already panicking, as that aborts and obscures the original panic.
    if cfg!(debug_assertions) && !thread::panicking() {
        panic!("block lease accounting defect: {error}");
    }
}

/// A lease on a pinned region of memory rented from a [`Pool`][crate::Pool].
///
/// The block stays valid, at a fixed address, for as long as any lease on it exists. Each `Block`
/// value is one lease; additional leases on the same region are obtained via [`retain()`][1] and
/// [`pin()`][2]. Dropping a `Block` releases its lease. When the last lease is released the region
/// returns to the pool for reuse.
///
/// The contents of a freshly rented block are unspecified. Memory is not zeroed between uses, so
/// a block may contain bytes written by a previous lease holder.
///
/// # Examples
///
/// ```
/// use slab_pool::Pool;
///
/// let pool = Pool::new();
///
/// let mut block = pool.rent(100)?;
/// assert!(block.len() >= 100);
///
/// block.as_mut_bytes()?[..5].copy_from_slice(b"hello");
///
/// let shared = block.retain()?;
/// assert_eq!(&shared.as_bytes()?[..5], b"hello");
///
/// // The region stays leased until both handles are gone.
/// assert!(block.release());
/// assert!(!shared.release());
/// # Ok::<(), slab_pool::Error>(())
/// ```
///
/// # Thread safety
///
/// The type is [`Send`] and [`Sync`]. Leases may be retained and released concurrently from any
/// thread.
///
/// [1]: Self::retain
/// [2]: Self::pin
pub struct Block {
    core: Arc<BlockCore>,
}

impl Block {
    pub(crate) fn from_core(core: Arc<BlockCore>) -> Self {
        Self { core }
    }

    #[cfg(test)]
    pub(crate) fn slab_for_test(&self) -> Arc<Slab> {
        Arc::clone(&self.core.slab)
    }

    /// The number of bytes in the block.
    ///
    /// This may be larger than the size requested when renting the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len
    }

    /// Whether the block has a length of zero bytes. Blocks rented from a pool never do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.len == 0
    }

    /// Offset of the block inside the slab that backs it.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.core.offset
    }

    /// The number of leases currently held on the block, including this one.
    ///
    /// The value may be outdated by the time it is returned if other threads hold leases.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.core.reference_count()
    }

    /// Whether the block has been [disposed][Self::dispose].
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Takes an additional lease on the same region of memory.
    ///
    /// The region stays valid until every lease has been released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the block has been disposed.
    ///
    /// # Examples
    ///
    /// ```
    /// use slab_pool::Pool;
    ///
    /// let pool = Pool::new();
    ///
    /// let block = pool.rent(64)?;
    /// let second = block.retain()?;
    ///
    /// assert_eq!(block.reference_count(), 2);
    /// assert_eq!(block.offset(), second.offset());
    /// # Ok::<(), slab_pool::Error>(())
    /// ```
    pub fn retain(&self) -> Result<Self> {
        self.core.retain()?;

        Ok(Self {
            core: Arc::clone(&self.core),
        })
    }

    /// Releases this lease. Returns whether the block is still alive, i.e. whether other
    /// leases on it remain.
    ///
    /// This is equivalent to dropping the block, except that it reports the outcome.
    #[must_use = "use drop() if you are not interested in whether the block is still alive"]
    pub fn release(self) -> bool {
        let this = ManuallyDrop::new(self);

        // SAFETY: `this` is never used or dropped again, so moving the core out leaves no
        // duplicate owner behind.
        let core = unsafe { ptr::read(&this.core) };

        release_lease(&core)
    }

    /// Permanently retires the block.
    ///
    /// A disposed block can no longer be retained, pinned or accessed through any lease. Leases
    /// that exist at the time of disposal must still be released (dropped), after which the
    /// region is handed back to its slab but never reused by the pool.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    /// Shared view of the contents of the block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the block has been disposed.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        if self.core.is_disposed() {
            return Err(Error::Disposed);
        }

        // SAFETY: This lease keeps the slab memory allocated and the region belongs to this block
        // alone. No exclusive reference can exist at the same time: `as_mut_bytes()` requires the
        // only lease on the block and we hold a shared reference to a lease right now.
        Ok(unsafe { slice::from_raw_parts(self.core.ptr_at(0).as_ptr(), self.core.len) })
    }

    /// Exclusive view of the contents of the block.
    ///
    /// Only available while this is the only lease on the block, so the view cannot alias any
    /// view obtained through a retained handle or a raw handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the block has been disposed and [`Error::NotExclusive`] if
    /// other leases on the block exist.
    pub fn as_mut_bytes(&mut self) -> Result<&mut [u8]> {
        if self.core.is_disposed() {
            return Err(Error::Disposed);
        }

        let reference_count = self.core.reference_count();

        if reference_count != 1 {
            return Err(Error::NotExclusive { reference_count });
        }

        // SAFETY: This lease keeps the slab memory allocated and the region belongs to this block
        // alone. This is the only lease and we hold it exclusively, so nobody can obtain another
        // lease (that requires a reference to this one) or any view of the memory meanwhile.
        Ok(unsafe { slice::from_raw_parts_mut(self.core.ptr_at(0).as_ptr(), self.core.len) })
    }

    /// Obtains a raw pointer to the byte at `byte_offset` in the block, for interop with code
    /// that needs a fixed address (e.g. native I/O APIs).
    ///
    /// The returned handle holds its own lease, so the memory stays valid for as long as the
    /// handle exists, even if this block is dropped. `byte_offset` may equal the length of the
    /// block, producing a pointer one past the end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOutOfRange`] if `byte_offset` is beyond the end of the block and
    /// [`Error::Disposed`] if the block has been disposed.
    ///
    /// # Examples
    ///
    /// ```
    /// use slab_pool::Pool;
    ///
    /// let pool = Pool::new();
    /// let block = pool.rent(64)?;
    ///
    /// let handle = block.pin(16)?;
    /// assert_eq!(handle.len(), block.len() - 16);
    ///
    /// // SAFETY: The handle keeps the memory alive and nothing else accesses it right now.
    /// unsafe {
    ///     handle.as_ptr().write(42);
    /// }
    ///
    /// drop(handle);
    /// assert_eq!(block.as_bytes()?[16], 42);
    /// # Ok::<(), slab_pool::Error>(())
    /// ```
    pub fn pin(&self, byte_offset: usize) -> Result<RawHandle> {
        if byte_offset > self.core.len {
            return Err(Error::OffsetOutOfRange {
                offset: byte_offset,
                length: self.core.len,
            });
        }

        let lease = self.retain()?;
        let ptr = lease.core.ptr_at(byte_offset);
        let len = self
            .core
            .len
            .checked_sub(byte_offset)
            .expect("guarded by bounds check above");

        Ok(RawHandle::new(lease, ptr, len))
    }
}

fn release_lease(core: &Arc<BlockCore>) -> bool {
    match core.release() {
        Ok(alive) => alive,
        Err(e) => {
            report_accounting_defect(&e);
            false
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        release_lease(&self.core);
    }
}

impl fmt::Debug for Block {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("core", &self.core)
            .finish()
    }
}
