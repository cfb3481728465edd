/// A snapshot of the state of a [`Pool`][crate::Pool], for monitoring.
///
/// The values are gathered without stopping concurrent users of the pool, so they may not be
/// consistent with each other if the pool is in use while the snapshot is taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Pooled slabs whose memory has not yet been released, including draining ones.
    pub slab_count: usize,

    /// Pooled slabs that still offer new blocks.
    pub active_slab_count: usize,

    /// Bytes of pooled slab memory that has not yet been released. This is the quantity
    /// limited by the configured capacity.
    pub pooled_bytes: usize,

    /// Blocks currently leased from pooled slabs.
    pub leased_blocks: usize,

    /// Blocks waiting on the free list for reuse.
    pub free_blocks: usize,

    /// Rent requests served by reusing a block from the free list.
    pub rents_reused: u64,

    /// Rent requests served by carving a new block from a pooled slab.
    pub rents_carved: u64,

    /// Rent requests served from a dedicated allocation outside the pooled slabs.
    pub rents_unpooled: u64,

    /// Rent requests rejected because of the capacity limit.
    pub rents_rejected: u64,
}

impl PoolStats {
    /// Fraction of successful rent requests that were served by reusing a block (0.0 to 1.0).
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "a ratio for monitoring does not need full precision"
    )]
    pub fn reuse_rate(&self) -> f64 {
        let total = self
            .rents_reused
            .saturating_add(self.rents_carved)
            .saturating_add(self.rents_unpooled);

        if total == 0 {
            0.0
        } else {
            self.rents_reused as f64 / total as f64
        }
    }
}
