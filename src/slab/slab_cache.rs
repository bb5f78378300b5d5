//! A cache of equally sized objects.
//!
//! The cache owns its slabs (kept on full/partial/empty lists behind one
//! `SpinNoIrq`) and one LIFO buffer per CPU. Allocation and free go through
//! the current CPU's buffer with no lock held; only refills and flushes,
//! moving `batchcount` objects at a time, take the cache lock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use kernel_guard::NoPreemptIrqSave;
use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use super::array_cache::{default_limit, CpuSlot, PerCpuCache};
use super::debug::{report_corruption, DebugLayout, GuardFault, GuardKind};
use super::geometry::{self, SlabGeometry};
use super::slab_lists::CacheLists;
use super::slab_node::{Slab, SlabFault, SlabState};
use crate::config::SlabConfig;
use crate::page_map::{CacheId, PageMap, PageMetadata, SlabId};
use crate::stats::CacheStats;
use crate::{
    AllocError, AllocFlags, AllocResult, CacheFlags, CpuEnv, PageSource, MAX_NAME_LEN, WORD_SIZE,
};

/// Constructor or destructor run on an object's memory.
///
/// Hooks must not allocate from or free to the cache they serve.
pub type ObjectHook = Box<dyn Fn(NonNull<u8>) + Send + Sync>;

/// The collaborators a cache operation needs.
pub(crate) struct SlabEnv<'a> {
    pub pages: &'a dyn PageSource,
    pub cpus: &'a dyn CpuEnv,
    pub page_map: &'a PageMap,
    pub config: &'a SlabConfig,
    pub page_size: usize,
}

/// What the caller asked for when creating a cache.
pub(crate) struct CacheParams {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub flags: CacheFlags,
    pub ctor: Option<ObjectHook>,
    pub dtor: Option<ObjectHook>,
    pub general: bool,
}

pub struct Cache {
    id: CacheId,
    name: String,
    object_size: usize,
    buffer_size: usize,
    align: usize,
    flags: CacheFlags,
    geometry: SlabGeometry,
    debug: DebugLayout,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    general: bool,
    dead: AtomicBool,
    lists: SpinNoIrq<CacheLists>,
    cpu_caches: Box<[CpuSlot]>,
}

fn invalid(name: &str, why: &str) -> AllocError {
    warn!("cache `{}` rejected: {}", name, why);
    AllocError::InvalidArgument
}

fn free_limit(nr_cpus: usize, batchcount: usize, objects: usize) -> Option<usize> {
    nr_cpus
        .checked_add(1)?
        .checked_mul(batchcount)?
        .checked_add(objects)
}

/// One fresh buffer per CPU, or `None` if any of them cannot be allocated.
fn cpu_buffers(nr_cpus: usize, limit: usize, batchcount: usize) -> Option<Vec<PerCpuCache>> {
    let mut buffers = Vec::new();
    buffers.try_reserve_exact(nr_cpus).ok()?;
    for _ in 0..nr_cpus {
        buffers.push(PerCpuCache::try_new(limit, batchcount)?);
    }
    Some(buffers)
}

impl Cache {
    pub(crate) fn new(id: CacheId, params: CacheParams, env: &SlabEnv) -> AllocResult<Self> {
        let CacheParams {
            name,
            size,
            align,
            mut flags,
            ctor,
            dtor,
            general,
        } = params;

        if name.is_empty() || name.len() >= MAX_NAME_LEN {
            return Err(invalid(&name, "bad name length"));
        }
        if size < WORD_SIZE || size > env.config.max_object_size(env.page_size) {
            return Err(invalid(&name, "object size out of range"));
        }
        if align != 0 && (!align.is_power_of_two() || align > env.page_size) {
            return Err(invalid(&name, "bad alignment"));
        }
        if dtor.is_some() && ctor.is_none() {
            return Err(invalid(&name, "destructor without constructor"));
        }

        let forced = env.config.forced_debug;
        if forced.contains(CacheFlags::POISON) && ctor.is_none() {
            flags |= CacheFlags::POISON;
        }
        if forced.contains(CacheFlags::RED_ZONE)
            && !flags.contains(CacheFlags::MUST_HW_ALIGN)
            && align <= WORD_SIZE
            && size + 2 * WORD_SIZE <= env.config.max_object_size(env.page_size)
        {
            flags |= CacheFlags::RED_ZONE;
        }

        if flags.contains(CacheFlags::POISON) && ctor.is_some() {
            warn!("cache `{}`: poisoning dropped, it would clobber constructed objects", name);
            flags.remove(CacheFlags::POISON);
        }
        if flags.contains(CacheFlags::RED_ZONE) {
            if flags.contains(CacheFlags::MUST_HW_ALIGN) {
                return Err(invalid(&name, "MUST_HW_ALIGN cannot be red-zoned"));
            }
            if align > WORD_SIZE {
                return Err(invalid(&name, "red zones need word alignment"));
            }
            flags.remove(CacheFlags::HW_ALIGN);
        }
        if flags.contains(CacheFlags::MUST_HW_ALIGN) {
            flags |= CacheFlags::HW_ALIGN;
        }

        let mut ralign = WORD_SIZE;
        if flags.contains(CacheFlags::HW_ALIGN) {
            ralign = env.config.cache_line;
            if !flags.contains(CacheFlags::MUST_HW_ALIGN) {
                while size <= ralign / 2 && ralign / 2 >= WORD_SIZE {
                    ralign /= 2;
                }
            }
        }
        ralign = ralign.max(align);

        let debug = DebugLayout::new(
            flags.contains(CacheFlags::RED_ZONE),
            flags.contains(CacheFlags::POISON),
            size,
        );
        let buffer_size = crate::align_up(debug.slot_size(), ralign);
        let geometry = geometry::compute(buffer_size, ralign, env.page_size, env.config)
            .ok_or_else(|| invalid(&name, "no slab geometry fits the object"))?;

        let nr_cpus = env.cpus.nr_cpus();
        let limit = default_limit(buffer_size, env.page_size);
        let batchcount = (limit + 1) / 2;
        let ceiling = free_limit(nr_cpus, batchcount, geometry.objects)
            .ok_or_else(|| invalid(&name, "free-object ceiling overflows"))?;
        let Some(buffers) = cpu_buffers(nr_cpus, limit, batchcount) else {
            warn!("cache `{}`: no memory for per-CPU buffers", name);
            return Err(AllocError::OutOfMemory);
        };
        let cpu_caches = buffers
            .into_iter()
            .map(CpuSlot::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let lists = CacheLists::new(ceiling, limit, batchcount);

        debug!(
            "cache `{}`: size {} slot {} align {}, order {} x {} objects, {} colours, {}",
            name,
            size,
            buffer_size,
            ralign,
            geometry.order,
            geometry.objects,
            geometry.colour,
            if geometry.off_slab { "off-slab" } else { "on-slab" }
        );

        Ok(Self {
            id,
            name,
            object_size: size,
            buffer_size,
            align: ralign,
            flags,
            geometry,
            debug,
            ctor,
            dtor,
            general,
            dead: AtomicBool::new(false),
            lists: SpinNoIrq::new(lists),
            cpu_caches,
        })
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size requested at creation.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Distance between two slots, including guards and padding.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Flags in effect after creation-time adjustments.
    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    pub fn geometry(&self) -> SlabGeometry {
        self.geometry
    }

    pub fn objects_per_slab(&self) -> usize {
        self.geometry.objects
    }

    pub fn is_general(&self) -> bool {
        self.general
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Current per-CPU `(limit, batchcount)`.
    pub fn cpu_tunables(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.limit, lists.batchcount)
    }

    fn corruption(&self, slot: usize, fault: GuardFault) -> ! {
        report_corruption(fault.into_report(&self.name, slot + self.debug.obj_offset()))
    }

    /// Allocate one object, growing the cache if every slab is full.
    pub(crate) fn alloc(&self, env: &SlabEnv, flags: AllocFlags) -> Option<NonNull<u8>> {
        if self.is_dead() {
            warn!("alloc from destroyed cache `{}`", self.name);
            return None;
        }
        if flags.contains(AllocFlags::DMA) && !self.flags.contains(CacheFlags::DMA) {
            warn!("DMA allocation requested from non-DMA cache `{}`", self.name);
            return None;
        }

        loop {
            if let Some(slot) = self.alloc_from_cpu(env) {
                return Some(self.finish_alloc(slot));
            }
            if let Err(err) = self.grow(env, flags) {
                // Another CPU may have returned objects while we were growing.
                if let Some(slot) = self.alloc_from_cpu(env) {
                    return Some(self.finish_alloc(slot));
                }
                warn!("cache `{}`: allocation failed: {}", self.name, err);
                return None;
            }
        }
    }

    fn alloc_from_cpu(&self, env: &SlabEnv) -> Option<usize> {
        let _guard = NoPreemptIrqSave::new();
        // SAFETY: preemption and interrupts are off, so this CPU owns its slot.
        let ac = unsafe { self.cpu_caches[env.cpus.current_cpu()].get_mut() };
        match ac.pop() {
            Some(slot) => {
                #[cfg(feature = "tracking")]
                {
                    ac.alloc_hits += 1;
                }
                Some(slot)
            }
            None => self.refill(env, ac),
        }
    }

    fn finish_alloc(&self, slot: usize) -> NonNull<u8> {
        if let Err(fault) = self.debug.on_alloc(slot) {
            self.corruption(slot, fault);
        }
        let obj = slot + self.debug.obj_offset();
        // SAFETY: slots live inside page blocks, which are never at address 0.
        unsafe { NonNull::new_unchecked(obj as *mut u8) }
    }

    /// Move up to `batchcount` objects from the slab lists into `ac`.
    fn refill(&self, env: &SlabEnv, ac: &mut PerCpuCache) -> Option<usize> {
        let mut batch = ac.batchcount;
        if !ac.touched && batch > env.config.batch_refill_limit {
            batch = env.config.batch_refill_limit;
        }

        let mut lists = self.lists.lock();
        #[cfg(feature = "tracking")]
        {
            lists.counters.alloc_misses += 1;
        }
        while batch > 0 {
            let id = match lists.first(SlabState::Partial) {
                Some(id) => id,
                None => match lists.first(SlabState::Empty) {
                    Some(id) => {
                        lists.free_touched = true;
                        id
                    }
                    None => break,
                },
            };

            let Some(slab) = lists.slab_mut(id) else {
                break;
            };
            let mut taken = 0;
            while batch > 0 {
                let Some(slot) = slab.get_obj(self.buffer_size) else {
                    break;
                };
                ac.push(slot);
                taken += 1;
                batch -= 1;
            }
            lists.free_objects -= taken;
            lists.relink(id);
        }
        #[cfg(feature = "tracking")]
        {
            let free = lists.free_objects;
            let total = lists.total_slabs() * self.geometry.objects;
            let active = total - free;
            if active > lists.counters.high_mark {
                lists.counters.high_mark = active;
            }
        }
        drop(lists);

        ac.touched = true;
        ac.pop()
    }

    /// Return an object to the cache.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this cache and not have been freed since.
    pub(crate) unsafe fn free(&self, env: &SlabEnv, ptr: NonNull<u8>) {
        if self.is_dead() {
            warn!(
                "free of {:p} to destroyed cache `{}` ignored",
                ptr.as_ptr(),
                self.name
            );
            return;
        }

        let slot = (ptr.as_ptr() as usize).wrapping_sub(self.debug.obj_offset());
        if self.debug.enabled() {
            let owner = env.page_map.lookup(slot).and_then(|meta| meta.owning_cache);
            if owner != Some(self.id) {
                self.corruption(slot, GuardFault::new(GuardKind::ForeignObject));
            }
            if let Err(fault) = self.debug.on_free(slot) {
                self.corruption(slot, fault);
            }
        }

        let _guard = NoPreemptIrqSave::new();
        // SAFETY: preemption and interrupts are off, so this CPU owns its slot.
        let ac = unsafe { self.cpu_caches[env.cpus.current_cpu()].get_mut() };
        if ac.is_full() {
            self.flush(env, ac);
        }
        #[cfg(feature = "tracking")]
        {
            ac.free_hits += 1;
        }
        ac.push(slot);
        ac.touched = true;
    }

    /// Hand the `batchcount` oldest buffered objects back to their slabs.
    fn flush(&self, env: &SlabEnv, ac: &mut PerCpuCache) {
        let n = ac.batchcount.min(ac.avail);
        let mut lists = self.lists.lock();
        #[cfg(feature = "tracking")]
        {
            lists.counters.free_misses += 1;
        }
        self.free_block(env, &mut lists, ac.front(n));
        drop(lists);
        ac.discard_front(n);
    }

    /// Put `slots` back on their slabs, releasing slabs the cache no longer needs.
    ///
    /// Returns the number of slabs released.
    fn free_block(&self, env: &SlabEnv, lists: &mut CacheLists, slots: &[usize]) -> usize {
        let mut released = 0;
        for &slot in slots {
            let id = match env.page_map.lookup(slot) {
                Some(PageMetadata {
                    owning_cache: Some(cache),
                    owning_slab: Some(id),
                }) if cache == self.id => id,
                _ => self.corruption(slot, GuardFault::new(GuardKind::ForeignObject)),
            };
            let Some(slab) = lists.slab_mut(id) else {
                self.corruption(slot, GuardFault::new(GuardKind::ForeignObject));
            };
            match slab.put_obj(slot, self.buffer_size) {
                Ok(()) => {}
                Err(SlabFault::BadAddress) => {
                    self.corruption(slot, GuardFault::new(GuardKind::BadAddress))
                }
                Err(SlabFault::DoubleFree) => {
                    self.corruption(slot, GuardFault::new(GuardKind::DoubleFree))
                }
            }
            let now_empty = slab.inuse == 0;
            lists.free_objects += 1;

            if now_empty && lists.free_objects > lists.free_limit {
                lists.free_objects -= self.geometry.objects;
                if let Some(slab) = lists.take(id) {
                    self.destroy_slab(env, slab);
                    released += 1;
                }
            } else {
                lists.relink(id);
            }
        }
        released
    }

    /// Add one slab to the empty list.
    fn grow(&self, env: &SlabEnv, flags: AllocFlags) -> AllocResult {
        let colour_offset = {
            let mut lists = self.lists.lock();
            let offset = lists.colour_next;
            lists.colour_next += 1;
            if lists.colour_next >= self.geometry.colour {
                lists.colour_next = 0;
            }
            offset * self.geometry.colour_off
        };

        let mut page_flags = flags;
        if self.flags.contains(CacheFlags::DMA) {
            page_flags |= AllocFlags::DMA;
        }
        let order = self.geometry.order;
        let Some(block) = env.pages.acquire(order, page_flags) else {
            warn!(
                "cache `{}`: page source has no order-{} block",
                self.name, order
            );
            return Err(AllocError::OutOfMemory);
        };
        if block.addr == 0 || !crate::is_aligned(block.addr, env.page_size) {
            error!(
                "cache `{}`: page source returned misaligned block {:#x}",
                self.name, block.addr
            );
            env.pages.release(block, order);
            return Err(AllocError::OutOfMemory);
        }

        let slab = Slab::new(block, colour_offset, &self.geometry);
        for index in 0..self.geometry.objects {
            let slot = slab.slot_addr(index, self.buffer_size);
            self.debug.init_slot(slot);
            if let Some(ctor) = &self.ctor {
                // SAFETY: slots lie inside a freshly acquired, non-null block.
                ctor(unsafe { NonNull::new_unchecked((slot + self.debug.obj_offset()) as *mut u8) });
            }
        }

        let mut lists = self.lists.lock();
        let id = lists.insert(slab);
        env.page_map.tag(
            block.addr,
            self.geometry.pages(),
            PageMetadata {
                owning_cache: Some(self.id),
                owning_slab: Some(id),
            },
        );
        lists.free_objects += self.geometry.objects;
        #[cfg(feature = "tracking")]
        {
            lists.counters.grown += 1;
        }
        debug!(
            "cache `{}`: grew slab {:?} at {:#x} (colour offset {})",
            self.name, id, block.addr, colour_offset
        );
        Ok(())
    }

    /// Check, destruct and release a slab already unlinked from the lists.
    fn destroy_slab(&self, env: &SlabEnv, slab: Slab) {
        env.page_map.untag(slab.block.addr);
        for index in 0..slab.objects {
            let slot = slab.slot_addr(index, self.buffer_size);
            if self.debug.enabled() {
                if let Err(fault) = self.debug.check_free_slot(slot) {
                    self.corruption(slot, fault);
                }
            }
            if let Some(dtor) = &self.dtor {
                // SAFETY: see `grow`.
                dtor(unsafe { NonNull::new_unchecked((slot + self.debug.obj_offset()) as *mut u8) });
            }
        }
        env.pages.release(slab.block, self.geometry.order);
    }

    /// Release the `n` oldest objects of one CPU buffer to the slabs.
    fn drain_array(&self, env: &SlabEnv, ac: &mut PerCpuCache, n: usize) -> usize {
        let n = n.min(ac.avail);
        if n == 0 {
            return 0;
        }
        let mut lists = self.lists.lock();
        self.free_block(env, &mut lists, ac.front(n));
        drop(lists);
        ac.discard_front(n);
        n
    }

    /// Empty every CPU buffer into the slabs.
    pub(crate) fn drain_cpu_caches(&self, env: &SlabEnv) -> usize {
        let mut drained = 0;
        env.cpus.on_each_cpu(&mut |cpu| {
            // SAFETY: `on_each_cpu` is exclusive with that CPU's fast path.
            let ac = unsafe { self.cpu_caches[cpu].get_mut() };
            let avail = ac.avail;
            drained += self.drain_array(env, ac, avail);
        });
        drained
    }

    /// Release every empty slab; true when no slab holds live objects.
    pub(crate) fn shrink(&self, env: &SlabEnv) -> bool {
        self.drain_cpu_caches(env);
        let mut lists = self.lists.lock();
        while let Some(id) = lists.last(SlabState::Empty) {
            let Some(slab) = lists.take(id) else {
                break;
            };
            lists.free_objects -= self.geometry.objects;
            self.destroy_slab(env, slab);
        }
        lists.count(SlabState::Partial) == 0 && lists.count(SlabState::Full) == 0
    }

    /// Drain and release everything, failing while live objects remain.
    pub(crate) fn release_all(&self, env: &SlabEnv) -> AllocResult {
        if self.shrink(env) {
            Ok(())
        } else {
            warn!("cache `{}` still has live objects", self.name);
            Err(AllocError::Busy)
        }
    }

    /// Resize every CPU buffer.
    pub(crate) fn tune(&self, env: &SlabEnv, limit: usize, batchcount: usize) -> AllocResult {
        if batchcount == 0 || batchcount > limit {
            warn!(
                "cache `{}`: bad tunables limit {} batchcount {}",
                self.name, limit, batchcount
            );
            return Err(AllocError::InvalidArgument);
        }
        if self.is_dead() {
            return Err(AllocError::InvalidArgument);
        }
        let Some(ceiling) = free_limit(env.cpus.nr_cpus(), batchcount, self.geometry.objects)
        else {
            warn!("cache `{}`: batchcount {} overflows the ceiling", self.name, batchcount);
            return Err(AllocError::InvalidArgument);
        };
        // Nothing changes until every new buffer exists.
        let Some(buffers) = cpu_buffers(env.cpus.nr_cpus(), limit, batchcount) else {
            warn!("cache `{}`: no memory for {} per-CPU entries", self.name, limit);
            return Err(AllocError::OutOfMemory);
        };
        let mut fresh: Vec<Option<PerCpuCache>> = buffers.into_iter().map(Some).collect();

        {
            let mut lists = self.lists.lock();
            lists.limit = limit;
            lists.batchcount = batchcount;
            lists.free_limit = ceiling;
        }
        env.cpus.on_each_cpu(&mut |cpu| {
            let Some(new) = fresh.get_mut(cpu).and_then(Option::take) else {
                return;
            };
            // SAFETY: `on_each_cpu` is exclusive with that CPU's fast path.
            let ac = unsafe { self.cpu_caches[cpu].get_mut() };
            let mut old = core::mem::replace(ac, new);
            let avail = old.avail;
            self.drain_array(env, &mut old, avail);
        });
        info!(
            "cache `{}`: per-CPU limit {} batchcount {}",
            self.name, limit, batchcount
        );
        Ok(())
    }

    /// Reaper step for one CPU: trim the buffer unless it was used lately.
    ///
    /// Must run inside an `on_each_cpu` callback for `cpu`.
    pub(crate) fn reap_cpu_cache(&self, env: &SlabEnv, cpu: usize) -> usize {
        // SAFETY: the caller runs us from `on_each_cpu`.
        let ac = unsafe { self.cpu_caches[cpu].get_mut() };
        if ac.touched {
            ac.touched = false;
            return 0;
        }
        if ac.avail == 0 {
            return 0;
        }
        let divisor = env.config.reap_array_divisor;
        let mut tofree = (ac.limit + divisor - 1) / divisor;
        if tofree > ac.avail {
            tofree = (ac.avail + 1) / 2;
        }
        self.drain_array(env, ac, tofree)
    }

    /// Reaper step for the slab lists; returns the slabs released.
    pub(crate) fn reap_free_slabs(&self, env: &SlabEnv, now: u64) -> usize {
        let mut lists = self.lists.lock();
        if now < lists.next_reap {
            return 0;
        }
        lists.next_reap = now.saturating_add(env.config.reap_interval);
        if lists.free_touched {
            lists.free_touched = false;
            return 0;
        }

        let per_pass = env.config.reap_slab_divisor * self.geometry.objects;
        let budget = (lists.free_limit + per_pass - 1) / per_pass;
        let mut released = 0;
        while released < budget {
            let Some(id) = lists.last(SlabState::Empty) else {
                break;
            };
            let Some(slab) = lists.take(id) else {
                break;
            };
            lists.free_objects -= self.geometry.objects;
            self.destroy_slab(env, slab);
            released += 1;
        }
        #[cfg(feature = "tracking")]
        {
            lists.counters.reaped += released as u64;
        }
        released
    }

    /// Point-in-time statistics.
    pub(crate) fn snapshot(&self, env: &SlabEnv) -> CacheStats {
        let mut cpu_buffered = 0;
        #[cfg(feature = "tracking")]
        let (mut alloc_hits, mut free_hits) = (0, 0);
        env.cpus.on_each_cpu(&mut |cpu| {
            // SAFETY: `on_each_cpu` is exclusive with that CPU's fast path.
            let ac = unsafe { self.cpu_caches[cpu].get_mut() };
            cpu_buffered += ac.avail;
            #[cfg(feature = "tracking")]
            {
                alloc_hits += ac.alloc_hits;
                free_hits += ac.free_hits;
            }
        });

        let lists = self.lists.lock();
        let objects = self.geometry.objects;
        let total_slabs = lists.total_slabs();
        let total_objects = total_slabs * objects;
        #[cfg(feature = "tracking")]
        let counters = {
            let mut counters = lists.counters;
            counters.alloc_hits = alloc_hits;
            counters.free_hits = free_hits;
            counters
        };

        CacheStats {
            name: self.name.clone(),
            object_size: self.object_size,
            buffer_size: self.buffer_size,
            active_objects: total_objects
                .saturating_sub(lists.free_objects)
                .saturating_sub(cpu_buffered),
            total_objects,
            active_slabs: lists.count(SlabState::Full) + lists.count(SlabState::Partial),
            total_slabs,
            free_slabs: lists.count(SlabState::Empty),
            objects_per_slab: objects,
            pages_per_slab: self.geometry.pages(),
            limit: lists.limit,
            batchcount: lists.batchcount,
            free_limit: lists.free_limit,
            cpu_buffered,
            #[cfg(feature = "tracking")]
            counters,
        }
    }

    /// Audit the slab lists without changing them.
    pub(crate) fn verify(&self, env: &SlabEnv) -> AllocResult {
        let lists = self.lists.lock();
        let mut free_objects = 0;
        for state in [SlabState::Full, SlabState::Partial, SlabState::Empty] {
            let ids = lists.ids(state);
            if ids.len() != lists.count(state) {
                error!(
                    "cache `{}`: {:?} list length {} but {} linked",
                    self.name,
                    state,
                    lists.count(state),
                    ids.len()
                );
                return Err(AllocError::Corruption);
            }
            for id in ids {
                let Some(slab) = lists.slab(id) else {
                    error!("cache `{}`: dangling slab {:?}", self.name, id);
                    return Err(AllocError::Corruption);
                };
                self.verify_slab(env, id, slab, state)?;
                if state != SlabState::Full {
                    free_objects += slab.free_count();
                }
            }
        }
        if free_objects != lists.free_objects {
            error!(
                "cache `{}`: free object count {} but slabs hold {}",
                self.name, lists.free_objects, free_objects
            );
            return Err(AllocError::Corruption);
        }
        Ok(())
    }

    fn verify_slab(&self, env: &SlabEnv, id: SlabId, slab: &Slab, state: SlabState) -> AllocResult {
        let Some(chain) = slab.free_chain() else {
            error!("cache `{}`: slab {:?} has a broken free chain", self.name, id);
            return Err(AllocError::Corruption);
        };
        if slab.inuse + chain.len() != slab.objects {
            error!(
                "cache `{}`: slab {:?} has {} in use and {} free of {}",
                self.name,
                id,
                slab.inuse,
                chain.len(),
                slab.objects
            );
            return Err(AllocError::Corruption);
        }
        if slab.state != state || slab.expected_state() != state {
            error!(
                "cache `{}`: slab {:?} with {} in use sits on the {:?} list",
                self.name, id, slab.inuse, state
            );
            return Err(AllocError::Corruption);
        }
        let owner = env.page_map.lookup(slab.block.addr);
        let expected = PageMetadata {
            owning_cache: Some(self.id),
            owning_slab: Some(id),
        };
        if owner != Some(expected) {
            error!(
                "cache `{}`: slab {:?} pages tagged {:?}",
                self.name, id, owner
            );
            return Err(AllocError::Corruption);
        }
        if self.debug.enabled() {
            for index in chain {
                let slot = slab.slot_addr(index, self.buffer_size);
                if let Err(fault) = self.debug.check_free_slot(slot) {
                    error!(
                        "{}",
                        fault.into_report(&self.name, slot + self.debug.obj_offset())
                    );
                    return Err(AllocError::Corruption);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("buffer_size", &self.buffer_size)
            .field("flags", &self.flags)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

/// Shared reference to a registered cache.
#[derive(Clone)]
pub struct CacheHandle(pub(crate) Arc<Cache>);

impl CacheHandle {
    pub(crate) fn new(cache: Cache) -> Self {
        Self(Arc::new(cache))
    }
}

impl Deref for CacheHandle {
    type Target = Cache;

    fn deref(&self) -> &Cache {
        &self.0
    }
}

impl PartialEq for CacheHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CacheHandle {}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheHandle({} `{}`)", self.id, self.name)
    }
}
