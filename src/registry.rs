//! The list of live caches.
//!
//! Only management paths (create, destroy, lookup, reaping, statistics) take
//! the registry lock; allocation and free never do. Frees that carry only a
//! pointer resolve their cache through [`OwnerTable`] instead.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use kspin::{SpinNoIrq, SpinNoPreempt, SpinNoPreemptGuard};

use crate::page_map::CacheId;
use crate::slab::CacheHandle;
use crate::{AllocError, AllocResult};
#[cfg(feature = "log")]
use log::warn;

pub struct CacheRegistry {
    caches: SpinNoPreempt<Vec<CacheHandle>>,
}

impl CacheRegistry {
    pub const fn new() -> Self {
        Self {
            caches: SpinNoPreempt::new(Vec::new()),
        }
    }

    /// Run `f` with the registry locked.
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut Vec<CacheHandle>) -> R) -> R {
        f(&mut *self.caches.lock())
    }

    /// Lock the registry unless someone else holds it.
    pub(crate) fn try_lock(&self) -> Option<SpinNoPreemptGuard<'_, Vec<CacheHandle>>> {
        self.caches.try_lock()
    }

    /// Append `cache`, rejecting a name that is already registered.
    pub fn insert(&self, cache: CacheHandle) -> AllocResult {
        self.with_locked(|caches| insert_locked(caches, cache))
    }

    /// Remove `cache`; false if it was not registered.
    pub fn remove(&self, cache: &CacheHandle) -> bool {
        self.with_locked(|caches| remove_locked(caches, cache))
    }

    /// Visit every cache in creation order.
    pub fn iterate(&self, mut f: impl FnMut(&CacheHandle)) {
        for cache in self.caches.lock().iter() {
            f(cache);
        }
    }

    pub fn find(&self, name: &str) -> Option<CacheHandle> {
        self.caches
            .lock()
            .iter()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    pub fn find_id(&self, id: CacheId) -> Option<CacheHandle> {
        self.caches
            .lock()
            .iter()
            .find(|cache| cache.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache id to handle, for frees and size queries that only have a pointer.
///
/// Updated under the registry lock, read without it.
pub(crate) struct OwnerTable {
    owners: SpinNoIrq<BTreeMap<CacheId, CacheHandle>>,
}

impl OwnerTable {
    pub const fn new() -> Self {
        Self {
            owners: SpinNoIrq::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, cache: CacheHandle) {
        self.owners.lock().insert(cache.id(), cache);
    }

    pub fn remove(&self, id: CacheId) -> Option<CacheHandle> {
        self.owners.lock().remove(&id)
    }

    pub fn get(&self, id: CacheId) -> Option<CacheHandle> {
        self.owners.lock().get(&id).cloned()
    }

    pub fn clear(&self) {
        self.owners.lock().clear();
    }
}

pub(crate) fn insert_locked(caches: &mut Vec<CacheHandle>, cache: CacheHandle) -> AllocResult {
    if caches.iter().any(|c| c.name() == cache.name()) {
        warn!("cache name `{}` already registered", cache.name());
        return Err(AllocError::InvalidArgument);
    }
    caches.push(cache);
    Ok(())
}

pub(crate) fn remove_locked(caches: &mut Vec<CacheHandle>, cache: &CacheHandle) -> bool {
    match caches.iter().position(|c| c == cache) {
        Some(index) => {
            caches.remove(index);
            true
        }
        None => false,
    }
}
