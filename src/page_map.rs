//! Page-owner side table.
//!
//! Every page block carved into a slab is tagged with the cache and slab that
//! own it. `free_any` and `size_of` use the table to find an object's cache
//! from the bare pointer, and caches use it to find the slab an object
//! returns to.

use alloc::collections::BTreeMap;
use core::fmt;

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{error, warn};

/// Identifier of a cache, unique for the lifetime of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(pub(crate) u32);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a slab inside its cache's slab arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabId(pub(crate) u32);

impl SlabId {
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Owner record for a tagged page run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageMetadata {
    pub owning_cache: Option<CacheId>,
    pub owning_slab: Option<SlabId>,
}

#[derive(Debug, Clone, Copy)]
struct PageRun {
    pages: usize,
    meta: PageMetadata,
}

/// Tagged page runs keyed by their start address.
pub struct PageMap {
    runs: SpinNoIrq<BTreeMap<usize, PageRun>>,
    page_size: usize,
}

impl PageMap {
    pub const fn new(page_size: usize) -> Self {
        Self {
            runs: SpinNoIrq::new(BTreeMap::new()),
            page_size,
        }
    }

    /// Record `meta` as the owner of `pages` pages starting at `addr`.
    pub fn tag(&self, addr: usize, pages: usize, meta: PageMetadata) {
        let mut runs = self.runs.lock();
        if let Some(old) = runs.insert(addr, PageRun { pages, meta }) {
            error!(
                "page map: run at {:#x} re-tagged, previous owner {:?} ({} pages)",
                addr, old.meta, old.pages
            );
        }
    }

    /// Drop the tag of the run starting at `addr`.
    pub fn untag(&self, addr: usize) -> Option<PageMetadata> {
        let removed = self.runs.lock().remove(&addr).map(|run| run.meta);
        if removed.is_none() {
            warn!("page map: untag of unknown run at {:#x}", addr);
        }
        removed
    }

    /// Owner of the page containing `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<PageMetadata> {
        let runs = self.runs.lock();
        let (&start, run) = runs.range(..=addr).next_back()?;
        if addr < start + run.pages * self.page_size {
            Some(run.meta)
        } else {
            None
        }
    }

    /// Number of tagged runs.
    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
