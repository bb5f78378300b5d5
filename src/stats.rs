//! Read-only snapshots for external reporting.

use alloc::string::String;

/// Event counters kept per cache when the `tracking` feature is on.
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    /// Allocations served straight from a per-CPU buffer.
    pub alloc_hits: u64,
    /// Refills from the slab lists.
    pub alloc_misses: u64,
    /// Frees that found room in the per-CPU buffer.
    pub free_hits: u64,
    /// Flushes back to the slab lists.
    pub free_misses: u64,
    pub grown: u64,
    pub reaped: u64,
    /// Most objects ever handed out of the slabs at once.
    pub high_mark: usize,
}

/// One cache at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub object_size: usize,
    pub buffer_size: usize,
    /// Objects held by callers; objects parked in per-CPU buffers are not counted.
    pub active_objects: usize,
    pub total_objects: usize,
    /// Slabs with at least one object out.
    pub active_slabs: usize,
    pub total_slabs: usize,
    pub free_slabs: usize,
    pub objects_per_slab: usize,
    pub pages_per_slab: usize,
    pub limit: usize,
    pub batchcount: usize,
    pub free_limit: usize,
    pub cpu_buffered: usize,
    #[cfg(feature = "tracking")]
    pub counters: CacheCounters,
}

impl CacheStats {
    pub fn total_pages(&self) -> usize {
        self.total_slabs * self.pages_per_slab
    }
}
