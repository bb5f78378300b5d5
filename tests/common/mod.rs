//! Host-side page source and CPU environments shared by the integration tests.

#![allow(dead_code)]

use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;
use slab_cache_allocator::{AllocFlags, CpuEnv, PageBlock, PageSource};

pub const PAGE_SIZE: usize = 0x1000;

/// Page blocks carved from the host heap, limited to `budget` pages.
pub struct HostPageSource {
    budget: usize,
    blocks: SpinNoIrq<Vec<(usize, u32)>>,
    outstanding: AtomicUsize,
    dma_blocks: AtomicUsize,
    acquired: AtomicUsize,
}

impl HostPageSource {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            blocks: SpinNoIrq::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            dma_blocks: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
        }
    }

    fn layout(order: u32) -> Layout {
        Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE).unwrap()
    }

    /// Pages currently held by the allocator.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Blocks requested with `AllocFlags::DMA` so far.
    pub fn dma_blocks(&self) -> usize {
        self.dma_blocks.load(Ordering::SeqCst)
    }

    /// Blocks handed out so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl PageSource for HostPageSource {
    fn acquire(&self, order: u32, flags: AllocFlags) -> Option<PageBlock> {
        let pages = 1usize << order;
        let mut blocks = self.blocks.lock();
        if self.outstanding() + pages > self.budget {
            return None;
        }
        let addr = unsafe { alloc::alloc::alloc(Self::layout(order)) } as usize;
        if addr == 0 {
            return None;
        }
        blocks.push((addr, order));
        self.outstanding.fetch_add(pages, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if flags.contains(AllocFlags::DMA) {
            self.dma_blocks.fetch_add(1, Ordering::SeqCst);
        }
        Some(PageBlock { addr })
    }

    fn release(&self, block: PageBlock, order: u32) {
        let mut blocks = self.blocks.lock();
        let index = blocks
            .iter()
            .position(|&(addr, o)| addr == block.addr && o == order)
            .expect("released a block that was never acquired");
        blocks.swap_remove(index);
        unsafe { alloc::alloc::dealloc(block.addr as *mut u8, Self::layout(order)) };
        self.outstanding.fetch_sub(1 << order, Ordering::SeqCst);
    }
}

impl Drop for HostPageSource {
    fn drop(&mut self) {
        for &(addr, order) in self.blocks.lock().iter() {
            unsafe { alloc::alloc::dealloc(addr as *mut u8, Self::layout(order)) };
        }
    }
}

/// CPUs driven from one test thread; the current CPU is switched by hand.
pub struct SwitchableCpus {
    nr: usize,
    current: AtomicUsize,
}

impl SwitchableCpus {
    pub fn new(nr: usize) -> Self {
        Self {
            nr,
            current: AtomicUsize::new(0),
        }
    }

    pub fn switch_to(&self, cpu: usize) {
        assert!(cpu < self.nr);
        self.current.store(cpu, Ordering::SeqCst);
    }
}

// SAFETY: the tests using this environment run the allocator from a single
// thread, so the current CPU is never shared.
unsafe impl CpuEnv for SwitchableCpus {
    fn nr_cpus(&self) -> usize {
        self.nr
    }

    fn current_cpu(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn on_each_cpu(&self, f: &mut dyn FnMut(usize)) {
        for cpu in 0..self.nr {
            f(cpu);
        }
    }
}
