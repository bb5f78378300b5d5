//! General-purpose size classes.
//!
//! Arbitrary-size requests are served from a fixed ladder of caches named
//! `size-N`, each with a DMA-capable twin `size-N(DMA)`.

use alloc::format;
use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::warn;

use crate::slab::CacheHandle;

/// Size classes for general allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum SizeClass {
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
    Bytes1024 = 1024,
    Bytes2048 = 2048,
    Bytes4096 = 4096,
    Bytes8192 = 8192,
    Bytes16384 = 16384,
    Bytes32768 = 32768,
    Bytes65536 = 65536,
    Bytes131072 = 131072,
}

impl SizeClass {
    pub const COUNT: usize = 13;
    const MAX_OBJ_SIZE: usize = 131072;

    /// Smallest class holding `size` bytes.
    pub fn for_size(size: usize) -> Option<Self> {
        if size > Self::MAX_OBJ_SIZE {
            warn!("no size class for {} bytes", size);
            return None;
        }

        Some(match size {
            0..=32 => SizeClass::Bytes32,
            33..=64 => SizeClass::Bytes64,
            65..=128 => SizeClass::Bytes128,
            129..=256 => SizeClass::Bytes256,
            257..=512 => SizeClass::Bytes512,
            513..=1024 => SizeClass::Bytes1024,
            1025..=2048 => SizeClass::Bytes2048,
            2049..=4096 => SizeClass::Bytes4096,
            4097..=8192 => SizeClass::Bytes8192,
            8193..=16384 => SizeClass::Bytes16384,
            16385..=32768 => SizeClass::Bytes32768,
            32769..=65536 => SizeClass::Bytes65536,
            _ => SizeClass::Bytes131072,
        })
    }

    pub fn size(&self) -> usize {
        *self as usize
    }

    pub fn to_index(&self) -> usize {
        self.size().trailing_zeros() as usize - 5
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index >= Self::COUNT {
            return None;
        }
        Self::for_size(32 << index)
    }

    /// Name of the class's cache.
    pub fn cache_name(&self, dma: bool) -> alloc::string::String {
        if dma {
            format!("size-{}(DMA)", self.size())
        } else {
            format!("size-{}", self.size())
        }
    }
}

struct GeneralEntry {
    class: SizeClass,
    normal: CacheHandle,
    dma: CacheHandle,
}

/// The general caches, in ascending size order.
pub struct GeneralCaches {
    entries: Vec<GeneralEntry>,
}

impl GeneralCaches {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, class: SizeClass, normal: CacheHandle, dma: CacheHandle) {
        self.entries.push(GeneralEntry { class, normal, dma });
    }

    /// The smallest class of at least `size` bytes with matching DMA capability.
    pub fn select(&self, size: usize, dma: bool) -> Option<&CacheHandle> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.class.size() >= size)?;
        Some(if dma { &entry.dma } else { &entry.normal })
    }

    /// Every general cache, plain and DMA interleaved, smallest first.
    pub fn iter(&self) -> impl Iterator<Item = &CacheHandle> {
        self.entries
            .iter()
            .flat_map(|entry| [&entry.normal, &entry.dma])
    }

    /// Largest size the general caches serve.
    pub fn max_size(&self) -> usize {
        self.entries.last().map_or(0, |entry| entry.class.size())
    }

    pub fn classes(&self) -> impl Iterator<Item = SizeClass> + '_ {
        self.entries.iter().map(|entry| entry.class)
    }
}
