use crate::{DEFAULT_SLAB_SIZE, MIN_BLOCK_SIZE, OverflowPolicy, Pool};

/// Builder for creating an instance of [`Pool`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// The default configuration used by [`Pool::new()`][1] allocates slabs of
/// [`DEFAULT_SLAB_SIZE`] bytes and does not limit the capacity of the pool.
///
/// # Examples
///
/// ```
/// use slab_pool::Pool;
///
/// let pool = Pool::builder()
///     .slab_size(4096)
///     .max_total_bytes(1024 * 1024)
///     .build();
///
/// assert_eq!(pool.slab_size(), 4096);
/// assert_eq!(pool.max_total_bytes(), Some(1024 * 1024));
/// ```
///
/// [1]: Pool::new
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder {
    slab_size: usize,
    max_total_bytes: Option<usize>,
    overflow_policy: OverflowPolicy,
}

impl PoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            slab_size: DEFAULT_SLAB_SIZE,
            max_total_bytes: None,
            overflow_policy: OverflowPolicy::default(),
        }
    }

    /// Sets the size in bytes of each slab the pool allocates.
    ///
    /// Every slab has the same size. Blocks larger than the largest power of two that fits in a
    /// slab are served from dedicated allocations instead of pooled memory.
    pub fn slab_size(mut self, bytes: usize) -> Self {
        self.slab_size = bytes;
        self
    }

    /// Sets the maximum number of bytes of slab memory the pool may hold.
    ///
    /// The pool does not allocate a new slab if that would exceed this limit. Requests that
    /// cannot be served from existing slabs are then handled according to the
    /// [overflow policy][Self::overflow_policy].
    ///
    /// A limit smaller than the slab size means no slab is ever allocated.
    pub fn max_total_bytes(mut self, bytes: usize) -> Self {
        self.max_total_bytes = Some(bytes);
        self
    }

    /// Sets the [overflow policy][OverflowPolicy] for the pool. This governs how to serve
    /// requests once the pool has reached its capacity limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use slab_pool::{OverflowPolicy, Pool};
    ///
    /// let pool = Pool::builder()
    ///     .max_total_bytes(0)
    ///     .overflow_policy(OverflowPolicy::Fail)
    ///     .build();
    ///
    /// assert!(pool.rent(64).is_err());
    /// ```
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// No memory is allocated until the first block is rented.
    ///
    /// # Panics
    ///
    /// Panics if the slab size is smaller than [`MIN_BLOCK_SIZE`].
    #[must_use]
    pub fn build(self) -> Pool {
        assert!(
            self.slab_size >= MIN_BLOCK_SIZE,
            "slab size {} is smaller than the minimum block size {MIN_BLOCK_SIZE}",
            self.slab_size
        );

        Pool::new_inner(self.slab_size, self.max_total_bytes, self.overflow_policy)
    }
}
