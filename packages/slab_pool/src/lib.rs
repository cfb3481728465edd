//! A pool of reference-counted byte buffers carved from large pinned allocations.
//!
//! This crate provides [`Pool`], which hands out [`Block`]s: leases on fixed-address regions of
//! memory inside large allocations called slabs. Hot I/O paths (network readers and writers,
//! serializers) rent scratch buffers from the pool instead of allocating, and the buffers return
//! to the pool for reuse when the last lease on them is released.
//!
//! # Key Features
//!
//! - **Stable memory addresses**: Blocks never move, so raw pointers obtained via
//!   [`Block::pin()`] can be handed to native APIs
//! - **Reference-counted leases**: [`Block::retain()`] shares a block, the memory returns to the
//!   pool only after every lease is released
//! - **RAII release**: Dropping a [`Block`] or [`RawHandle`] releases its lease, so forgetting to
//!   release is impossible
//! - **Lock-free hot path**: Renting, retaining and releasing use atomic operations only; a lock
//!   is taken only to allocate a new slab
//! - **Bounded capacity**: An optional capacity limit with a configurable [`OverflowPolicy`]
//! - **Drain-based shrinking**: [`Pool::trim()`] and [`Pool::shrink_to_fit()`] deactivate slabs,
//!   which release their memory once their outstanding blocks come back
//!
//! Memory is not zeroed between uses. A freshly rented block may contain data written by a
//! previous lease holder.
//!
//! # Examples
//!
//! ```rust
//! use slab_pool::Pool;
//!
//! let pool = Pool::builder().slab_size(16 * 1024).build();
//!
//! // Rent a buffer and fill it.
//! let mut block = pool.rent(1500)?;
//! let payload = b"GET / HTTP/1.1\r\n\r\n";
//! block.as_mut_bytes()?[..payload.len()].copy_from_slice(payload);
//!
//! // Share it with another consumer. The memory stays leased until both are done.
//! let for_logging = block.retain()?;
//! assert_eq!(&for_logging.as_bytes()?[..3], b"GET");
//!
//! drop(block);
//! drop(for_logging);
//!
//! // The buffer is back on the free list and is reused by the next rent of the same size class.
//! let _next = pool.rent(2000)?;
//! assert_eq!(pool.stats().rents_reused, 1);
//! # Ok::<(), slab_pool::Error>(())
//! ```
//!
//! ## Native interop
//!
//! ```rust
//! use slab_pool::Pool;
//!
//! let pool = Pool::new();
//! let block = pool.rent(4096)?;
//!
//! // The raw handle holds its own lease, keeping the address valid while native code uses it.
//! let handle = block.pin(0)?;
//!
//! // SAFETY: The handle keeps the memory alive and the write stays within `handle.len()` bytes.
//! unsafe {
//!     handle.as_ptr().write_bytes(0, handle.len());
//! }
//!
//! drop(handle);
//! assert!(block.as_bytes()?.iter().all(|b| *b == 0));
//! # Ok::<(), slab_pool::Error>(())
//! ```

mod block;
mod builder;
mod error;
mod metrics;
mod overflow_policy;
mod pool;
mod raw_handle;
mod slab;
mod stats;

pub use block::Block;
pub(crate) use block::*;
pub use builder::*;
pub use error::Error;
pub(crate) use error::Result;
pub use overflow_policy::*;
pub use pool::{DEFAULT_SLAB_SIZE, MIN_BLOCK_SIZE, Pool};
pub(crate) use pool::PoolShared;
pub use raw_handle::*;
pub(crate) use slab::*;
pub use stats::*;
