/// Determines how the pool serves a rent request that cannot be satisfied from pooled memory
/// without growing the pool past its configured capacity.
///
/// Requests larger than the slab size of the pool are not affected by this policy. They never fit
/// into pooled memory and are always served from a dedicated allocation.
///
/// By default, such requests are served from a dedicated allocation that is returned to the
/// allocator as soon as the block is released.
///
/// # Examples
///
/// ```
/// use slab_pool::{OverflowPolicy, Pool};
///
/// // The overflow policy is set at pool creation time.
/// let pool = Pool::builder()
///     .slab_size(4096)
///     .max_total_bytes(16384)
///     .overflow_policy(OverflowPolicy::Fail)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum OverflowPolicy {
    /// The request is served from a dedicated allocation outside the pooled slabs. The memory
    /// does not count towards the capacity of the pool and is released together with the block.
    /// This is the default.
    #[default]
    AllocateUnpooled,

    /// The request fails with [`Error::CapacityExceeded`][crate::Error::CapacityExceeded].
    ///
    /// This may be valuable when the caller wants to apply backpressure instead of letting
    /// memory usage grow beyond the configured capacity.
    Fail,
}
