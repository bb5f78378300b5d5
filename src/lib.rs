//! Slab Cache Allocator
//!
//! This crate implements an object-caching memory allocator layered over a
//! page source, featuring:
//! - Caches of fixed-size objects with optional constructor/destructor
//! - Slab geometry selection with colouring and on/off-slab bufctl arrays
//! - Per-CPU LIFO buffers with batched refill/flush on the hot path
//! - General size classes (each with a DMA-capable twin) for arbitrary sizes
//! - Periodic reaping of idle per-CPU buffers and empty slabs
//! - Redzone/poison debugging switched on per cache at runtime
//!
//! # Bookkeeping memory
//!
//! Slab pages come from the embedder's [`PageSource`]. The allocator's own
//! bookkeeping (the page-owner table, each cache's slab arena, off-slab
//! bufctl arrays and per-CPU buffers) is allocated through `alloc`, so the
//! embedder must provide a global allocator that does not route back into
//! this crate's caches, and that is usable with interrupts disabled.

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for backward compatibility
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The platform word; the smallest object a cache can hold.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Cache names must be shorter than this.
pub const MAX_NAME_LEN: usize = 32;

/// The error type used by the slab layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Bad size, alignment, flag combination, tunable, or a duplicate name.
    InvalidArgument,
    /// The page source could not supply a block for a new slab.
    OutOfMemory,
    /// The cache still holds live objects.
    Busy,
    /// A redzone, poison or bookkeeping check failed.
    Corruption,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidArgument => "invalid argument",
            AllocError::OutOfMemory => "out of memory",
            AllocError::Busy => "cache busy",
            AllocError::Corruption => "slab corruption detected",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

bitflags::bitflags! {
    /// Flags fixed at cache creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CacheFlags: u32 {
        /// Align objects to the hardware cache line (may be relaxed for tiny objects).
        const HW_ALIGN = 1 << 0;
        /// Never trim this cache from the periodic reaper.
        const NO_REAP = 1 << 1;
        /// Back slabs with DMA-capable pages.
        const DMA = 1 << 2;
        /// Fill free objects with a pattern and verify it on allocation.
        const POISON = 1 << 3;
        /// Guard each object with a word on either side.
        const RED_ZONE = 1 << 4;
        /// Like `HW_ALIGN`, but never relaxed; incompatible with `RED_ZONE`.
        const MUST_HW_ALIGN = 1 << 5;
    }
}

impl CacheFlags {
    /// Flags that switch on debug instrumentation.
    pub const DEBUG: CacheFlags = CacheFlags::POISON.union(CacheFlags::RED_ZONE);
}

bitflags::bitflags! {
    /// Per-request allocation flags, forwarded to the page source on growth.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// The caller may sleep while the page source finds memory.
        const MAY_BLOCK = 1 << 0;
        /// The caller must not sleep.
        const ATOMIC = 1 << 1;
        /// The object must live in DMA-capable memory.
        const DMA = 1 << 2;
    }
}

/// A contiguous, page-aligned block of `1 << order` pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBlock {
    pub addr: usize,
}

/// Supplier of raw power-of-two page blocks.
///
/// Implementations do their own locking. `release` is called with the owning
/// cache's lock held and interrupts disabled, so it must not sleep.
///
/// The blocks it hands out hold objects only; slab management that does not
/// fit on-slab is allocated from the global heap, never from this source.
pub trait PageSource: Send + Sync {
    /// Acquire `1 << order` contiguous pages aligned to at least one page.
    fn acquire(&self, order: u32, flags: AllocFlags) -> Option<PageBlock>;

    /// Give back a block previously returned by `acquire` with the same order.
    fn release(&self, block: PageBlock, order: u32);
}

/// The CPU topology the per-CPU buffers are indexed by.
///
/// # Safety
///
/// The per-CPU fast path reads and writes its buffer without any lock. An
/// implementation must guarantee that:
/// - `nr_cpus` never changes and `current_cpu` is always below it;
/// - while preemption and local interrupts are disabled, no two execution
///   contexts observe the same `current_cpu` value;
/// - `on_each_cpu` runs the callback once per CPU, serially, each call being
///   exclusive with that CPU's fast path.
pub unsafe trait CpuEnv: Send + Sync {
    /// Number of CPUs, fixed for the allocator's lifetime.
    fn nr_cpus(&self) -> usize;

    /// The CPU executing the caller.
    fn current_cpu(&self) -> usize;

    /// Run `f(cpu)` in the context of every CPU.
    fn on_each_cpu(&self, f: &mut dyn FnMut(usize));
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod config;
pub use config::SlabConfig;

pub mod page_map;
pub use page_map::{CacheId, PageMap, PageMetadata, SlabId};

pub mod slab;
pub use slab::{Cache, CacheHandle, CorruptionReport, GuardKind, ObjectHook, SlabGeometry};

pub mod registry;
pub use registry::CacheRegistry;

pub mod general;
pub use general::{GeneralCaches, SizeClass};

pub mod reaper;
pub use reaper::ReapReport;

pub mod stats;
#[cfg(feature = "tracking")]
pub use stats::CacheCounters;
pub use stats::CacheStats;

pub mod context;
pub use context::AllocatorContext;

#[cfg(test)]
mod test_support;
