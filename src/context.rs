//! The allocator context: one per process or kernel instance.
//!
//! It owns the page source, the CPU environment, the page-owner table, the
//! cache registry and the general size classes. Nothing here is global; the
//! embedder decides where the context lives.

use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(feature = "log")]
use log::{info, warn};

use crate::general::{GeneralCaches, SizeClass};
use crate::page_map::{CacheId, PageMap};
use crate::reaper::{self, ReapReport};
use crate::registry::{self, CacheRegistry, OwnerTable};
use crate::slab::{Cache, CacheHandle, CacheParams, ObjectHook, SlabEnv};
use crate::stats::CacheStats;
use crate::{
    AllocError, AllocFlags, AllocResult, CacheFlags, CpuEnv, PageSource, SlabConfig,
    DEFAULT_PAGE_SIZE,
};

pub struct AllocatorContext<P, E, const PAGE_SIZE: usize = { DEFAULT_PAGE_SIZE }>
where
    P: PageSource,
    E: CpuEnv,
{
    pages: P,
    cpus: E,
    config: SlabConfig,
    page_map: PageMap,
    registry: CacheRegistry,
    owners: OwnerTable,
    general: GeneralCaches,
    next_id: AtomicU32,
    live: AtomicBool,
}

impl<P, E, const PAGE_SIZE: usize> AllocatorContext<P, E, PAGE_SIZE>
where
    P: PageSource,
    E: CpuEnv,
{
    /// Build a context and its general caches.
    pub fn new(pages: P, cpus: E, config: SlabConfig) -> AllocResult<Self> {
        config.validate(PAGE_SIZE)?;
        if cpus.nr_cpus() == 0 {
            warn!("allocator context needs at least one CPU");
            return Err(AllocError::InvalidArgument);
        }

        let mut ctx = Self {
            pages,
            cpus,
            config,
            page_map: PageMap::new(PAGE_SIZE),
            registry: CacheRegistry::new(),
            owners: OwnerTable::new(),
            general: GeneralCaches::new(),
            next_id: AtomicU32::new(0),
            live: AtomicBool::new(true),
        };
        match ctx.build_general() {
            Ok(general) => ctx.general = general,
            Err(err) => {
                ctx.live.store(false, Ordering::Release);
                return Err(err);
            }
        }
        info!(
            "allocator context up: {} CPUs, page size {:#x}, general classes up to {} bytes",
            ctx.cpus.nr_cpus(),
            PAGE_SIZE,
            ctx.general.max_size()
        );
        Ok(ctx)
    }

    fn build_general(&self) -> AllocResult<GeneralCaches> {
        let mut general = GeneralCaches::new();
        let max = self.config.max_object_size(PAGE_SIZE);
        for index in 0..SizeClass::COUNT {
            let Some(class) = SizeClass::from_index(index) else {
                break;
            };
            if class.size() > max {
                break;
            }
            let normal = self.register(class.cache_name(false), class.size(), CacheFlags::HW_ALIGN, true)?;
            let dma = self.register(
                class.cache_name(true),
                class.size(),
                CacheFlags::HW_ALIGN | CacheFlags::DMA,
                true,
            )?;
            general.push(class, normal, dma);
        }
        Ok(general)
    }

    fn register(
        &self,
        name: String,
        size: usize,
        flags: CacheFlags,
        general: bool,
    ) -> AllocResult<CacheHandle> {
        self.register_with_hooks(name, size, 0, flags, None, None, general)
    }

    #[allow(clippy::too_many_arguments)]
    fn register_with_hooks(
        &self,
        name: String,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        general: bool,
    ) -> AllocResult<CacheHandle> {
        let env = self.env();
        self.registry.with_locked(|caches| {
            let id = CacheId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let params = CacheParams {
                name,
                size,
                align,
                flags,
                ctor,
                dtor,
                general,
            };
            let handle = CacheHandle::new(Cache::new(id, params, &env)?);
            registry::insert_locked(caches, handle.clone())?;
            self.owners.insert(handle.clone());
            Ok(handle)
        })
    }

    fn env(&self) -> SlabEnv<'_> {
        SlabEnv {
            pages: &self.pages,
            cpus: &self.cpus,
            page_map: &self.page_map,
            config: &self.config,
            page_size: PAGE_SIZE,
        }
    }

    fn ensure_live(&self) -> AllocResult {
        if self.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            warn!("allocator context already torn down");
            Err(AllocError::InvalidArgument)
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Create a cache of `size`-byte objects.
    ///
    /// `align` of 0 means word alignment. `ctor` runs on every slot when a
    /// slab is grown and `dtor` on every slot when a slab is released; neither
    /// runs on individual alloc/free, and neither may use this cache.
    pub fn create(
        &self,
        name: &str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
    ) -> AllocResult<CacheHandle> {
        self.ensure_live()?;
        let handle =
            self.register_with_hooks(String::from(name), size, align, flags, ctor, dtor, false)?;
        info!(
            "cache `{}` created: {} bytes, {} per slab, order {}",
            handle.name(),
            handle.object_size(),
            handle.objects_per_slab(),
            handle.geometry().order
        );
        Ok(handle)
    }

    /// Release every slab of `cache` and unregister it.
    ///
    /// Fails with `Busy`, leaving the cache usable, while objects are out.
    pub fn destroy(&self, cache: &CacheHandle) -> AllocResult {
        self.ensure_live()?;
        if cache.is_general() || cache.is_dead() {
            warn!("cache `{}` cannot be destroyed", cache.name());
            return Err(AllocError::InvalidArgument);
        }

        let env = self.env();
        self.registry.with_locked(|caches| {
            if !caches.contains(cache) {
                return Err(AllocError::InvalidArgument);
            }
            cache.release_all(&env)?;
            registry::remove_locked(caches, cache);
            self.owners.remove(cache.id());
            cache.mark_dead();
            Ok(())
        })?;
        info!("cache `{}` destroyed", cache.name());
        Ok(())
    }

    pub fn alloc(&self, cache: &CacheHandle, flags: AllocFlags) -> Option<NonNull<u8>> {
        if !self.is_live() {
            return None;
        }
        cache.alloc(&self.env(), flags)
    }

    /// Give an object back to its cache.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on `cache` (or `allocate_any`
    /// served by it) and not freed since.
    pub unsafe fn free(&self, cache: &CacheHandle, ptr: NonNull<u8>) {
        if !self.is_live() {
            warn!("free after teardown ignored");
            return;
        }
        unsafe { cache.free(&self.env(), ptr) }
    }

    pub fn tune(&self, cache: &CacheHandle, limit: usize, batchcount: usize) -> AllocResult {
        self.ensure_live()?;
        cache.tune(&self.env(), limit, batchcount)
    }

    /// Release every empty slab; true when the cache holds no objects.
    pub fn shrink(&self, cache: &CacheHandle) -> bool {
        if !self.is_live() || cache.is_dead() {
            return false;
        }
        cache.shrink(&self.env())
    }

    /// Allocate at least `size` bytes from the general caches.
    pub fn allocate_any(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if !self.is_live() {
            return None;
        }
        let Some(cache) = self.general.select(size, flags.contains(AllocFlags::DMA)) else {
            warn!("allocate_any: {} bytes is above every size class", size);
            return None;
        };
        cache.alloc(&self.env(), flags)
    }

    fn owner_of(&self, ptr: NonNull<u8>) -> Option<CacheHandle> {
        let id = self
            .page_map
            .lookup(ptr.as_ptr() as usize)?
            .owning_cache?;
        self.owners.get(id)
    }

    /// Free an object without naming its cache.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this context and not have been freed since.
    pub unsafe fn free_any(&self, ptr: NonNull<u8>) {
        if !self.is_live() {
            warn!("free after teardown ignored");
            return;
        }
        match self.owner_of(ptr) {
            Some(cache) => unsafe { cache.free(&self.env(), ptr) },
            None => {
                warn!("free_any: {:p} is not a slab object", ptr.as_ptr());
            }
        }
    }

    /// Object size of the cache `ptr` belongs to.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        if !self.is_live() {
            return None;
        }
        self.owner_of(ptr).map(|cache| cache.object_size())
    }

    /// One reaper pass; `now` is a monotonic tick count.
    pub fn reap(&self, now: u64) -> ReapReport {
        if !self.is_live() {
            return ReapReport::default();
        }
        reaper::reap(&self.registry, &self.env(), now)
    }

    /// Statistics for every registered cache, in creation order.
    pub fn stats(&self) -> Vec<CacheStats> {
        if !self.is_live() {
            return Vec::new();
        }
        let mut caches = Vec::new();
        self.registry.iterate(|cache| caches.push(cache.clone()));
        let env = self.env();
        caches.iter().map(|cache| cache.snapshot(&env)).collect()
    }

    pub fn cache_stats(&self, cache: &CacheHandle) -> CacheStats {
        cache.snapshot(&self.env())
    }

    /// Audit a cache's slab bookkeeping and guards.
    pub fn verify(&self, cache: &CacheHandle) -> AllocResult {
        self.ensure_live()?;
        cache.verify(&self.env())
    }

    pub fn find(&self, name: &str) -> Option<CacheHandle> {
        self.registry.find(name)
    }

    pub fn general(&self) -> &GeneralCaches {
        &self.general
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    pub fn page_source(&self) -> &P {
        &self.pages
    }

    pub fn cpus(&self) -> &E {
        &self.cpus
    }

    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    /// Release the general caches and shut the context down.
    ///
    /// Fails with `Busy` while a user cache is registered or a general object
    /// is still out; the context stays usable in that case.
    pub fn teardown(&self) -> AllocResult {
        self.ensure_live()?;
        let env = self.env();
        self.registry.with_locked(|caches| {
            if let Some(cache) = caches.iter().find(|cache| !cache.is_general()) {
                warn!("teardown: cache `{}` still registered", cache.name());
                return Err(AllocError::Busy);
            }
            for cache in caches.iter() {
                cache.release_all(&env)?;
            }
            for cache in caches.drain(..) {
                cache.mark_dead();
            }
            self.owners.clear();
            Ok(())
        })?;
        self.live.store(false, Ordering::Release);
        info!("allocator context torn down");
        Ok(())
    }
}

impl<P, E, const PAGE_SIZE: usize> Drop for AllocatorContext<P, E, PAGE_SIZE>
where
    P: PageSource,
    E: CpuEnv,
{
    fn drop(&mut self) {
        if self.is_live() {
            warn!(
                "allocator context dropped without teardown, {} caches registered",
                self.registry.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockPageSource, TestCpus};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    type Ctx = AllocatorContext<MockPageSource, TestCpus>;

    fn context() -> Ctx {
        Ctx::new(MockPageSource::new(1024), TestCpus::new(2), SlabConfig::new()).unwrap()
    }

    #[test]
    fn test_general_caches_registered() {
        let ctx = context();
        assert_eq!(ctx.registry().len(), 2 * SizeClass::COUNT);
        assert!(ctx.find("size-32").unwrap().is_general());
        assert!(ctx
            .find("size-4096(DMA)")
            .unwrap()
            .flags()
            .contains(CacheFlags::DMA));
        assert_eq!(ctx.general().max_size(), 131072);
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_create_rejects_bad_arguments() {
        let ctx = context();
        let none = || -> Option<ObjectHook> { None };
        let err = Err(AllocError::InvalidArgument);

        assert_eq!(ctx.create("", 64, 0, CacheFlags::empty(), none(), none()).map(|_| ()), err);
        assert_eq!(
            ctx.create("a-very-long-cache-name-over-the-limit", 64, 0, CacheFlags::empty(), none(), none())
                .map(|_| ()),
            err
        );
        assert_eq!(ctx.create("tiny", 1, 0, CacheFlags::empty(), none(), none()).map(|_| ()), err);
        assert_eq!(
            ctx.create("huge", 256 * 1024, 0, CacheFlags::empty(), none(), none()).map(|_| ()),
            err
        );
        assert_eq!(ctx.create("odd", 64, 24, CacheFlags::empty(), none(), none()).map(|_| ()), err);
        assert_eq!(
            ctx.create("must", 64, 0, CacheFlags::MUST_HW_ALIGN | CacheFlags::RED_ZONE, none(), none())
                .map(|_| ()),
            err
        );
        assert_eq!(
            ctx.create("wide", 64, 64, CacheFlags::RED_ZONE, none(), none()).map(|_| ()),
            err
        );
        let dtor: ObjectHook = Box::new(|_| {});
        assert_eq!(
            ctx.create("dtor", 64, 0, CacheFlags::empty(), none(), Some(dtor)).map(|_| ()),
            err
        );
        assert_eq!(
            ctx.create("size-64", 64, 0, CacheFlags::empty(), none(), none()).map(|_| ()),
            err
        );
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_flag_adjustments() {
        let ctx = context();
        let ctor: ObjectHook = Box::new(|_| {});
        let poisoned = ctx
            .create("ctor", 64, 0, CacheFlags::POISON, Some(ctor), None)
            .unwrap();
        assert!(!poisoned.flags().contains(CacheFlags::POISON));

        let zoned = ctx
            .create("zoned", 64, 0, CacheFlags::HW_ALIGN | CacheFlags::RED_ZONE, None, None)
            .unwrap();
        assert!(!zoned.flags().contains(CacheFlags::HW_ALIGN));
        assert_eq!(zoned.buffer_size(), 64 + 2 * crate::WORD_SIZE);

        let aligned = ctx
            .create("aligned", 20, 0, CacheFlags::HW_ALIGN, None, None)
            .unwrap();
        assert_eq!(aligned.align(), 32);
        let strict = ctx
            .create("strict", 20, 0, CacheFlags::MUST_HW_ALIGN, None, None)
            .unwrap();
        assert_eq!(strict.align(), 64);
        assert!(strict.flags().contains(CacheFlags::HW_ALIGN));

        for cache in [poisoned, zoned, aligned, strict] {
            ctx.destroy(&cache).unwrap();
        }
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_forced_debug_applies_where_it_fits() {
        let config = SlabConfig::new().with_forced_debug(CacheFlags::RED_ZONE);
        let ctx = Ctx::new(MockPageSource::new(1024), TestCpus::new(1), config).unwrap();
        assert!(ctx.find("size-64").unwrap().flags().contains(CacheFlags::RED_ZONE));
        assert!(!ctx
            .find("size-131072")
            .unwrap()
            .flags()
            .contains(CacheFlags::RED_ZONE));

        let strict = ctx
            .create("strict", 64, 0, CacheFlags::MUST_HW_ALIGN, None, None)
            .unwrap();
        assert!(!strict.flags().contains(CacheFlags::RED_ZONE));
        ctx.destroy(&strict).unwrap();
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_constructor_and_destructor_timing() {
        let ctx = context();
        let built = Arc::new(AtomicUsize::new(0));
        let torn = Arc::new(AtomicUsize::new(0));
        let (b, t) = (built.clone(), torn.clone());
        let cache = ctx
            .create(
                "hooked",
                128,
                0,
                CacheFlags::empty(),
                Some(Box::new(move |_| {
                    b.fetch_add(1, Ordering::Relaxed);
                })),
                Some(Box::new(move |_| {
                    t.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();

        let per_slab = cache.objects_per_slab();
        let obj = ctx.alloc(&cache, AllocFlags::MAY_BLOCK).unwrap();
        assert_eq!(built.load(Ordering::Relaxed), per_slab);
        unsafe { ctx.free(&cache, obj) };
        let again = ctx.alloc(&cache, AllocFlags::MAY_BLOCK).unwrap();
        assert_eq!(again, obj);
        assert_eq!(built.load(Ordering::Relaxed), per_slab);
        assert_eq!(torn.load(Ordering::Relaxed), 0);

        unsafe { ctx.free(&cache, again) };
        ctx.destroy(&cache).unwrap();
        assert_eq!(torn.load(Ordering::Relaxed), per_slab);
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_destroy_busy_then_ok() {
        let ctx = context();
        let cache = ctx.create("busy", 64, 0, CacheFlags::empty(), None, None).unwrap();
        let obj = ctx.alloc(&cache, AllocFlags::MAY_BLOCK).unwrap();
        assert_eq!(ctx.destroy(&cache), Err(AllocError::Busy));
        assert!(ctx.find("busy").is_some());

        unsafe { ctx.free(&cache, obj) };
        ctx.destroy(&cache).unwrap();
        assert!(ctx.find("busy").is_none());
        assert!(cache.is_dead());
        assert!(ctx.alloc(&cache, AllocFlags::MAY_BLOCK).is_none());
        assert_eq!(ctx.destroy(&cache), Err(AllocError::InvalidArgument));
        assert_eq!(ctx.page_source().outstanding(), 0);
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_pointer_lookups_skip_the_registry_lock() {
        let ctx = context();
        let cache = ctx.create("by-pointer", 72, 0, CacheFlags::empty(), None, None).unwrap();
        let obj = ctx.alloc(&cache, AllocFlags::MAY_BLOCK).unwrap();
        let general = ctx.allocate_any(300, AllocFlags::MAY_BLOCK).unwrap();

        {
            // Management work in progress elsewhere holds the registry.
            let _registry = ctx.registry().try_lock().unwrap();
            assert_eq!(ctx.size_of(obj), Some(72));
            assert_eq!(ctx.size_of(general), Some(512));
            unsafe {
                ctx.free_any(obj);
                ctx.free_any(general);
            }
        }
        assert_eq!(ctx.cache_stats(&cache).active_objects, 0);

        ctx.destroy(&cache).unwrap();
        let small = ctx.alloc(&ctx.find("size-64").unwrap(), AllocFlags::MAY_BLOCK).unwrap();
        assert_eq!(ctx.size_of(small), Some(64));
        unsafe { ctx.free_any(small) };
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_general_cache_cannot_be_destroyed() {
        let ctx = context();
        let general = ctx.find("size-128").unwrap();
        assert_eq!(ctx.destroy(&general), Err(AllocError::InvalidArgument));
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_teardown_refuses_while_in_use() {
        let ctx = context();
        let cache = ctx.create("user", 64, 0, CacheFlags::empty(), None, None).unwrap();
        assert_eq!(ctx.teardown(), Err(AllocError::Busy));
        ctx.destroy(&cache).unwrap();

        let obj = ctx.allocate_any(100, AllocFlags::MAY_BLOCK).unwrap();
        assert_eq!(ctx.teardown(), Err(AllocError::Busy));
        unsafe { ctx.free_any(obj) };

        ctx.teardown().unwrap();
        assert_eq!(ctx.page_source().outstanding(), 0);
        assert!(ctx.allocate_any(100, AllocFlags::MAY_BLOCK).is_none());
        assert_eq!(
            ctx.create("late", 64, 0, CacheFlags::empty(), None, None).map(|_| ()),
            Err(AllocError::InvalidArgument)
        );
        assert_eq!(ctx.teardown(), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn test_rejects_bad_context() {
        assert!(Ctx::new(MockPageSource::new(1), TestCpus::new(0), SlabConfig::new()).is_err());
        let config = SlabConfig::new().with_reap_divisors(5, 0);
        assert!(Ctx::new(MockPageSource::new(1), TestCpus::new(1), config).is_err());
        let config = SlabConfig {
            cache_line: 4,
            ..SlabConfig::new()
        };
        assert!(Ctx::new(MockPageSource::new(1), TestCpus::new(1), config).is_err());
    }
}
