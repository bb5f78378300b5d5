//! Per-CPU LIFO buffers of free slots.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

/// Default per-CPU limit for a slot size.
pub(crate) fn default_limit(buffer_size: usize, page_size: usize) -> usize {
    if buffer_size > 128 * 1024 {
        1
    } else if buffer_size > page_size {
        8
    } else if buffer_size > 1024 {
        24
    } else if buffer_size > 256 {
        54
    } else {
        120
    }
}

pub(crate) struct PerCpuCache {
    pub avail: usize,
    pub limit: usize,
    pub batchcount: usize,
    pub touched: bool,
    entries: Box<[usize]>,
    #[cfg(feature = "tracking")]
    pub alloc_hits: u64,
    #[cfg(feature = "tracking")]
    pub free_hits: u64,
}

impl PerCpuCache {
    /// An empty buffer, or `None` if its `limit` entries cannot be allocated.
    pub fn try_new(limit: usize, batchcount: usize) -> Option<Self> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(limit).ok()?;
        entries.resize(limit, 0);
        Some(Self {
            avail: 0,
            limit,
            batchcount,
            touched: false,
            entries: entries.into_boxed_slice(),
            #[cfg(feature = "tracking")]
            alloc_hits: 0,
            #[cfg(feature = "tracking")]
            free_hits: 0,
        })
    }

    pub fn is_full(&self) -> bool {
        self.avail == self.limit
    }

    /// Most recently pushed slot.
    pub fn pop(&mut self) -> Option<usize> {
        if self.avail == 0 {
            return None;
        }
        self.touched = true;
        self.avail -= 1;
        Some(self.entries[self.avail])
    }

    pub fn push(&mut self, addr: usize) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries[self.avail] = addr;
        self.avail += 1;
        true
    }

    /// The `n` oldest entries, the ones a flush hands back.
    pub fn front(&self, n: usize) -> &[usize] {
        &self.entries[..n.min(self.avail)]
    }

    /// Drop the `n` oldest entries and slide the rest down.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.avail);
        self.entries.copy_within(n..self.avail, 0);
        self.avail -= n;
    }
}

/// One CPU's buffer, touched only by that CPU or by a cross-call to it.
pub(crate) struct CpuSlot(UnsafeCell<PerCpuCache>);

// SAFETY: each slot is only accessed by its own CPU with preemption and
// interrupts off, or from `CpuEnv::on_each_cpu`, which is exclusive with it.
unsafe impl Sync for CpuSlot {}

impl CpuSlot {
    pub fn new(ac: PerCpuCache) -> Self {
        Self(UnsafeCell::new(ac))
    }

    /// # Safety
    ///
    /// The caller must be running on this slot's CPU with preemption and
    /// local interrupts disabled, or inside an `on_each_cpu` callback for it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut PerCpuCache {
        unsafe { &mut *self.0.get() }
    }
}
