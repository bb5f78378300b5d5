//! Tunable parameters of the slab layer.
//!
//! Geometry limits follow the classic slab defaults; the reaper's period and
//! trimming fractions are deliberately plain numbers so embedders can tune them
//! against their own timer resolution.

#[cfg(feature = "log")]
use log::warn;

use crate::{AllocError, AllocResult, CacheFlags, DEFAULT_PAGE_SIZE, WORD_SIZE};

/// Highest page order a slab may use.
pub const DEFAULT_MAX_ORDER: u32 = 5;
/// Stop searching larger orders once this order is reached.
pub const DEFAULT_BREAK_ORDER: u32 = 2;
/// Leftover bytes may be at most `slab_bytes >> 3`.
pub const DEFAULT_FRAG_SHIFT: u32 = 3;
/// Off-slab bufctl arrays are limited to one page of `u32` entries.
pub const DEFAULT_OFFSLAB_LIMIT: usize = DEFAULT_PAGE_SIZE / core::mem::size_of::<u32>();
/// L1 cache line assumed for `HW_ALIGN` and colouring.
pub const DEFAULT_CACHE_LINE: usize = 64;
/// Refill cap for a per-CPU buffer that was idle since its last refill.
pub const DEFAULT_BATCH_REFILL_LIMIT: usize = 16;
/// Ticks between two slab reclaim passes over the same cache.
pub const DEFAULT_REAP_INTERVAL: u64 = 4000;
/// The reaper trims roughly `1 / divisor` of an idle per-CPU buffer.
pub const DEFAULT_REAP_ARRAY_DIVISOR: usize = 5;
/// The reaper releases roughly `free_limit / divisor` objects worth of slabs.
pub const DEFAULT_REAP_SLAB_DIVISOR: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    pub max_order: u32,
    pub break_order: u32,
    pub frag_shift: u32,
    pub offslab_limit: usize,
    pub cache_line: usize,
    pub batch_refill_limit: usize,
    pub reap_interval: u64,
    pub reap_array_divisor: usize,
    pub reap_slab_divisor: usize,
    /// Debug flags OR-ed into every cache created through the context.
    pub forced_debug: CacheFlags,
}

impl SlabConfig {
    pub const fn new() -> Self {
        Self {
            max_order: DEFAULT_MAX_ORDER,
            break_order: DEFAULT_BREAK_ORDER,
            frag_shift: DEFAULT_FRAG_SHIFT,
            offslab_limit: DEFAULT_OFFSLAB_LIMIT,
            cache_line: DEFAULT_CACHE_LINE,
            batch_refill_limit: DEFAULT_BATCH_REFILL_LIMIT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            reap_array_divisor: DEFAULT_REAP_ARRAY_DIVISOR,
            reap_slab_divisor: DEFAULT_REAP_SLAB_DIVISOR,
            forced_debug: CacheFlags::empty(),
        }
    }

    pub const fn with_max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    pub const fn with_break_order(mut self, break_order: u32) -> Self {
        self.break_order = break_order;
        self
    }

    pub const fn with_offslab_limit(mut self, limit: usize) -> Self {
        self.offslab_limit = limit;
        self
    }

    pub const fn with_batch_refill_limit(mut self, limit: usize) -> Self {
        self.batch_refill_limit = limit;
        self
    }

    pub const fn with_reap_interval(mut self, ticks: u64) -> Self {
        self.reap_interval = ticks;
        self
    }

    pub const fn with_reap_divisors(mut self, array: usize, slab: usize) -> Self {
        self.reap_array_divisor = array;
        self.reap_slab_divisor = slab;
        self
    }

    /// Only the debug bits of `flags` are kept.
    pub const fn with_forced_debug(mut self, flags: CacheFlags) -> Self {
        self.forced_debug = flags.intersection(CacheFlags::DEBUG);
        self
    }

    /// Largest slot a cache can be created for.
    pub const fn max_object_size(&self, page_size: usize) -> usize {
        page_size << self.max_order
    }

    pub(crate) fn validate(&self, page_size: usize) -> AllocResult {
        let sane = page_size.is_power_of_two()
            && self.max_order < 16
            && self.break_order <= self.max_order
            && self.frag_shift > 0
            && self.frag_shift < 16
            && self.offslab_limit > 0
            && self.cache_line.is_power_of_two()
            && self.cache_line >= WORD_SIZE
            && self.cache_line <= page_size
            && self.batch_refill_limit > 0
            && self.reap_array_divisor > 0
            && self.reap_slab_divisor > 0;
        if sane {
            Ok(())
        } else {
            warn!("slab config rejected: {:?}", self);
            Err(AllocError::InvalidArgument)
        }
    }
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SlabConfig::default().validate(DEFAULT_PAGE_SIZE).is_ok());
        assert_eq!(
            SlabConfig::new().max_object_size(DEFAULT_PAGE_SIZE),
            128 * 1024
        );
    }

    #[test]
    fn test_config_rejects_nonsense() {
        let config = SlabConfig::new().with_break_order(DEFAULT_MAX_ORDER + 1);
        assert_eq!(
            config.validate(DEFAULT_PAGE_SIZE),
            Err(AllocError::InvalidArgument)
        );

        let config = SlabConfig::new().with_reap_divisors(0, 5);
        assert_eq!(
            config.validate(DEFAULT_PAGE_SIZE),
            Err(AllocError::InvalidArgument)
        );

        // Hardware alignment and colouring must never go below a word.
        for cache_line in [1, 2, WORD_SIZE / 2] {
            let config = SlabConfig {
                cache_line,
                ..SlabConfig::new()
            };
            assert_eq!(
                config.validate(DEFAULT_PAGE_SIZE),
                Err(AllocError::InvalidArgument)
            );
        }
        let config = SlabConfig {
            cache_line: WORD_SIZE,
            ..SlabConfig::new()
        };
        assert!(config.validate(DEFAULT_PAGE_SIZE).is_ok());

        assert_eq!(
            SlabConfig::new().validate(3000),
            Err(AllocError::InvalidArgument)
        );
    }

    #[test]
    fn test_forced_debug_keeps_only_debug_bits() {
        let config =
            SlabConfig::new().with_forced_debug(CacheFlags::RED_ZONE | CacheFlags::NO_REAP);
        assert_eq!(config.forced_debug, CacheFlags::RED_ZONE);
    }
}
