//! Periodic trimming of idle per-CPU buffers and cold empty slabs.
//!
//! The embedder's timer calls [`AllocatorContext::reap`] with a monotonic tick
//! count. Each call trims every reapable cache's per-CPU buffers that were not
//! used since the previous call, then releases a bounded number of empty slabs
//! from caches whose reap deadline has passed.
//!
//! [`AllocatorContext::reap`]: crate::AllocatorContext::reap

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, trace};

use crate::registry::CacheRegistry;
use crate::slab::{CacheHandle, SlabEnv};
use crate::CacheFlags;

/// What one reaper run gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub caches_scanned: usize,
    /// Objects moved from per-CPU buffers back to their slabs.
    pub objects_drained: usize,
    pub slabs_released: usize,
    pub pages_released: usize,
    /// The registry was busy and the run was skipped.
    pub skipped: bool,
}

pub(crate) fn reap(registry: &CacheRegistry, env: &SlabEnv, now: u64) -> ReapReport {
    let mut report = ReapReport::default();

    let caches: Vec<CacheHandle> = match registry.try_lock() {
        Some(caches) => caches
            .iter()
            .filter(|cache| !cache.flags().contains(CacheFlags::NO_REAP) && !cache.is_dead())
            .cloned()
            .collect(),
        None => {
            trace!("reaper: registry busy, skipping run at {}", now);
            report.skipped = true;
            return report;
        }
    };

    env.cpus.on_each_cpu(&mut |cpu| {
        for cache in &caches {
            report.objects_drained += cache.reap_cpu_cache(env, cpu);
        }
    });

    for cache in &caches {
        report.caches_scanned += 1;
        let slabs = cache.reap_free_slabs(env, now);
        report.slabs_released += slabs;
        report.pages_released += slabs * cache.geometry().pages();
    }

    if report.objects_drained > 0 || report.slabs_released > 0 {
        debug!(
            "reaper at {}: {} caches, {} objects drained, {} slabs ({} pages) released",
            now,
            report.caches_scanned,
            report.objects_drained,
            report.slabs_released,
            report.pages_released
        );
    }
    report
}
