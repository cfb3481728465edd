use std::fmt;
use std::ptr::NonNull;

use crate::Block;

/// A raw pointer into the memory of a [`Block`], valid for as long as the handle exists.
///
/// Returned by [`Block::pin()`]. The handle holds its own lease on the block, so the memory stays
/// allocated at the same address even if every other lease on the block is released. Dropping the
/// handle releases that lease.
///
/// The handle does not coordinate access to the memory. Reading or writing through the pointer is
/// `unsafe` and the caller is responsible for not racing with other users of the block.
#[must_use]
pub struct RawHandle {
    ptr: NonNull<u8>,

    /// Number of bytes from `ptr` to the end of the block.
    len: usize,

    _lease: Block,
}

impl RawHandle {
    pub(crate) fn new(lease: Block, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _lease: lease,
        }
    }

    /// The pinned address. Valid for reads and writes of [`len()`][Self::len] bytes while the
    /// handle exists.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The pinned address as a non-null pointer.
    #[must_use]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Number of bytes between the pinned address and the end of the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the pinned address is at the very end of the block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for RawHandle {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHandle")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// SAFETY: The handle only carries an address and a lease. The lease is thread-safe and any access
// through the address already requires `unsafe` code that takes responsibility for races.
unsafe impl Send for RawHandle {}

// SAFETY: See `Send` above. The handle exposes no safe way to touch the memory.
unsafe impl Sync for RawHandle {}
