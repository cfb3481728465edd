//! Metrics for the slab pool.
//!
//! The events are per-thread instances to keep the hot rent and release paths free of
//! contention. Snapshot-style values (slab counts, pooled bytes) are exposed through
//! [`Pool::stats()`][crate::Pool::stats] instead.

use nm::{Event, Magnitude};

/// Histogram buckets for the size of rent requests in bytes.
///
/// Most callers request scratch buffers between a small header and a few pages.
const RENT_SIZE_BYTES_BUCKETS: &[Magnitude] = &[
    64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 262_144, 1_048_576,
];

thread_local! {
    /// Size of each rent request, before rounding up to a size class.
    pub(crate) static RENT_SIZE_BYTES: Event = Event::builder()
        .name("slab_pool_rent_size_bytes")
        .histogram(RENT_SIZE_BYTES_BUCKETS)
        .build();

    /// A rent request was served by reusing a block from the free list.
    pub(crate) static RENT_REUSED: Event = Event::builder()
        .name("slab_pool_rent_reused")
        .build();

    /// A rent request was served by carving a new block from a pooled slab.
    pub(crate) static RENT_CARVED: Event = Event::builder()
        .name("slab_pool_rent_carved")
        .build();

    /// A rent request was served from a dedicated allocation outside the pooled slabs.
    pub(crate) static RENT_UNPOOLED: Event = Event::builder()
        .name("slab_pool_rent_unpooled")
        .build();

    /// A rent request was rejected. The magnitude is the requested size in bytes.
    pub(crate) static RENT_REJECTED: Event = Event::builder()
        .name("slab_pool_rent_rejected")
        .build();

    /// A new pooled slab was allocated. The magnitude is the slab size in bytes.
    pub(crate) static SLAB_ALLOCATED_BYTES: Event = Event::builder()
        .name("slab_pool_slab_allocated_bytes")
        .build();

    /// The backing memory of a slab was released. The magnitude is the slab size in bytes.
    pub(crate) static SLAB_RELEASED_BYTES: Event = Event::builder()
        .name("slab_pool_slab_released_bytes")
        .build();
}
