use thiserror::Error;

/// Errors that can occur when renting or using pooled blocks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The block has been disposed or has no remaining leases, so it can no longer
    /// be retained, pinned or accessed.
    #[error("the block has been disposed and can no longer be leased or accessed")]
    Disposed,

    /// A reference was released when no reference was held. This indicates a defect in
    /// the lease accounting and is never expected from safe usage of the public API.
    #[error("a block or slab reference was released while no references were held")]
    DoubleRelease,

    /// The requested byte offset lies beyond the end of the block.
    #[error("offset {offset} is out of range for a block of {length} bytes")]
    OffsetOutOfRange {
        /// The offset that was requested.
        offset: usize,

        /// The length of the block the offset was applied to.
        length: usize,
    },

    /// The memory allocator could not provide the requested backing memory.
    #[error("failed to allocate {size} bytes of backing memory")]
    AllocationFailed {
        /// The number of bytes that were requested from the allocator.
        size: usize,
    },

    /// The pool has reached its configured capacity and is configured to reject
    /// requests that cannot be served from pooled memory.
    #[error("cannot rent {requested} bytes without exceeding the pool capacity of {max_total_bytes} bytes")]
    CapacityExceeded {
        /// The number of bytes the caller asked for.
        requested: usize,

        /// The configured capacity of the pool.
        max_total_bytes: usize,
    },

    /// Exclusive access to the block contents was requested while other leases
    /// (retained handles or raw handles) still exist.
    #[error("exclusive access requires the only lease on the block but {reference_count} leases exist")]
    NotExclusive {
        /// The number of leases that existed at the time of the request.
        reference_count: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
