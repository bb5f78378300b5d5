//! Host-side collaborators for unit tests.

use alloc::alloc::{alloc, dealloc};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

use crate::{AllocFlags, CpuEnv, PageBlock, PageSource, DEFAULT_PAGE_SIZE};

/// Page blocks from the host heap, with a page budget.
pub(crate) struct MockPageSource {
    budget: usize,
    blocks: SpinNoIrq<Vec<(usize, u32)>>,
    outstanding: AtomicUsize,
}

impl MockPageSource {
    pub fn new(budget_pages: usize) -> Self {
        Self {
            budget: budget_pages,
            blocks: SpinNoIrq::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn layout(order: u32) -> Layout {
        let bytes = DEFAULT_PAGE_SIZE << order;
        Layout::from_size_align(bytes, DEFAULT_PAGE_SIZE).unwrap()
    }

    /// Pages handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl PageSource for MockPageSource {
    fn acquire(&self, order: u32, _flags: AllocFlags) -> Option<PageBlock> {
        let pages = 1 << order;
        let mut blocks = self.blocks.lock();
        if self.outstanding() + pages > self.budget {
            return None;
        }
        let addr = unsafe { alloc(Self::layout(order)) } as usize;
        if addr == 0 {
            return None;
        }
        blocks.push((addr, order));
        self.outstanding.fetch_add(pages, Ordering::SeqCst);
        Some(PageBlock { addr })
    }

    fn release(&self, block: PageBlock, order: u32) {
        let mut blocks = self.blocks.lock();
        let index = blocks
            .iter()
            .position(|&(addr, o)| addr == block.addr && o == order)
            .expect("release of a block the mock never handed out");
        blocks.swap_remove(index);
        unsafe { dealloc(block.addr as *mut u8, Self::layout(order)) };
        self.outstanding.fetch_sub(1 << order, Ordering::SeqCst);
    }
}

impl Drop for MockPageSource {
    fn drop(&mut self) {
        for &(addr, order) in self.blocks.lock().iter() {
            unsafe { dealloc(addr as *mut u8, Self::layout(order)) };
        }
    }
}

/// A single-threaded CPU environment whose current CPU can be switched.
pub(crate) struct TestCpus {
    nr: usize,
    current: AtomicUsize,
}

impl TestCpus {
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

// SAFETY: unit tests drive the allocator from one thread at a time, so the
// selected CPU is never observed by two contexts at once.
unsafe impl CpuEnv for TestCpus {
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
