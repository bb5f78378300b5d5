//! Slab geometry: how many slots fit a page block, and what is left for colouring.

#[cfg(feature = "log")]
use log::debug;

use crate::config::SlabConfig;

/// Bytes of one bufctl entry.
pub(crate) const BUFCTL_BYTES: usize = core::mem::size_of::<u32>();

/// Highest slot count a slab may have; the top two `u32` values are markers.
pub(crate) const SLAB_LIMIT: usize = (u32::MAX - 2) as usize;

/// The layout every slab of a cache shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabGeometry {
    /// Page order of each slab's block.
    pub order: u32,
    /// Slots per slab.
    pub objects: usize,
    /// Bytes not covered by slots or on-slab management.
    pub left_over: usize,
    /// Number of distinct colour offsets.
    pub colour: usize,
    /// Distance between two colour offsets.
    pub colour_off: usize,
    /// Whether the bufctl array lives outside the slab's pages.
    pub off_slab: bool,
    /// On-slab bytes reserved for the bufctl array (0 when off-slab).
    pub mgmt_size: usize,
}

impl SlabGeometry {
    pub fn pages(&self) -> usize {
        1 << self.order
    }

    pub fn slab_bytes(&self, page_size: usize) -> usize {
        page_size << self.order
    }
}

fn mgmt_bytes(objects: usize, mgmt_align: usize) -> usize {
    crate::align_up(objects * BUFCTL_BYTES, mgmt_align)
}

/// Slot count and leftover bytes for one candidate slab size.
pub(crate) fn estimate(
    slab_bytes: usize,
    buffer_size: usize,
    off_slab: bool,
    mgmt_align: usize,
) -> (usize, usize) {
    let used = |n: usize| {
        let mgmt = if off_slab { 0 } else { mgmt_bytes(n, mgmt_align) };
        n * buffer_size + mgmt
    };

    let mut objects = (slab_bytes / buffer_size).min(SLAB_LIMIT);
    while objects > 0 && used(objects) > slab_bytes {
        objects -= 1;
    }
    (objects, slab_bytes - used(objects))
}

/// Pick the slab geometry for slots of `buffer_size` bytes aligned to `align`.
///
/// Orders are tried from 0 upward. The first order whose leftover is at most
/// `slab_bytes >> frag_shift` is taken, as is the first order at or past
/// `break_order`; orders that fit no slot are skipped. An off-slab candidate
/// whose bufctl array would exceed `offslab_limit` entries is rejected and the
/// previous order kept.
pub(crate) fn compute(
    buffer_size: usize,
    align: usize,
    page_size: usize,
    config: &SlabConfig,
) -> Option<SlabGeometry> {
    let off_slab = buffer_size >= page_size >> 3;
    let colour_off = config.cache_line.max(align);

    let mut chosen = None;
    for order in 0..=config.max_order {
        let slab_bytes = page_size << order;
        let (objects, left_over) = estimate(slab_bytes, buffer_size, off_slab, colour_off);
        if objects == 0 {
            continue;
        }
        if off_slab && objects > config.offslab_limit {
            debug!(
                "slab geometry: order {} needs {} off-slab bufctls (limit {}), keeping previous order",
                order, objects, config.offslab_limit
            );
            break;
        }
        chosen = Some((order, objects, left_over));
        if order >= config.break_order {
            break;
        }
        if (left_over << config.frag_shift) <= slab_bytes {
            break;
        }
    }

    let (order, objects, mut left_over) = chosen?;
    let mut mgmt_size = 0;
    let mut placed_off_slab = off_slab;
    if off_slab {
        let on_slab = mgmt_bytes(objects, colour_off);
        if left_over >= on_slab {
            placed_off_slab = false;
            left_over -= on_slab;
            mgmt_size = on_slab;
        }
    } else {
        mgmt_size = mgmt_bytes(objects, colour_off);
    }

    Some(SlabGeometry {
        order,
        objects,
        left_over,
        colour: left_over / colour_off,
        colour_off,
        off_slab: placed_off_slab,
        mgmt_size,
    })
}
