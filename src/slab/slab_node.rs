//! A single slab: one page block carved into equal slots.
//!
//! Free slots are chained through a bufctl array of `u32` indices. Each free
//! entry holds the index of the next free slot; allocated entries hold
//! [`BUFCTL_ACTIVE`], so returning a slot twice is caught without any extra
//! state. The array sits right after the colour offset inside the slab, or in
//! a separate boxed slice when the geometry keeps management off-slab.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use super::geometry::SlabGeometry;
use crate::page_map::SlabId;
use crate::PageBlock;

/// Terminates the free chain.
pub(crate) const BUFCTL_END: u32 = u32::MAX;
/// Marks a slot handed out of the slab.
pub(crate) const BUFCTL_ACTIVE: u32 = u32::MAX - 1;

/// Which of the cache's three lists a slab sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlabState {
    Empty,
    Partial,
    Full,
}

/// Why a slot could not be put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlabFault {
    /// The address is outside the slot area or not on a slot boundary.
    BadAddress,
    /// The slot is already on the free chain.
    DoubleFree,
}

enum Bufctl {
    /// Address of the on-slab `u32` array.
    OnSlab(usize),
    OffSlab(Box<[u32]>),
}

impl Bufctl {
    fn get(&self, index: usize) -> u32 {
        match self {
            // SAFETY: the array was sized for every slot when the slab was built
            // and lives inside pages the slab owns.
            Bufctl::OnSlab(base) => unsafe { (*base as *const u32).add(index).read() },
            Bufctl::OffSlab(entries) => entries[index],
        }
    }

    fn set(&mut self, index: usize, value: u32) {
        match self {
            // SAFETY: see `get`.
            Bufctl::OnSlab(base) => unsafe { (*base as *mut u32).add(index).write(value) },
            Bufctl::OffSlab(entries) => entries[index] = value,
        }
    }
}

pub(crate) struct Slab {
    pub block: PageBlock,
    /// Address of slot 0.
    pub s_mem: usize,
    pub objects: usize,
    pub inuse: usize,
    free: u32,
    bufctl: Bufctl,
    pub state: SlabState,
    pub prev: Option<SlabId>,
    pub next: Option<SlabId>,
}

impl Slab {
    /// Lay out a slab over `block`, starting `colour_offset` bytes in.
    ///
    /// Every slot starts out free, chained in address order.
    pub fn new(block: PageBlock, colour_offset: usize, geometry: &SlabGeometry) -> Self {
        let objects = geometry.objects;
        let start = block.addr + colour_offset;
        let (mut bufctl, s_mem) = if geometry.off_slab {
            (Bufctl::OffSlab(vec![0u32; objects].into_boxed_slice()), start)
        } else {
            (Bufctl::OnSlab(start), start + geometry.mgmt_size)
        };

        for index in 0..objects {
            let next = if index + 1 == objects {
                BUFCTL_END
            } else {
                (index + 1) as u32
            };
            bufctl.set(index, next);
        }

        Self {
            block,
            s_mem,
            objects,
            inuse: 0,
            free: 0,
            bufctl,
            state: SlabState::Empty,
            prev: None,
            next: None,
        }
    }

    pub fn slot_addr(&self, index: usize, buffer_size: usize) -> usize {
        self.s_mem + index * buffer_size
    }

    pub fn slot_index(&self, addr: usize, buffer_size: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.s_mem)?;
        if offset % buffer_size != 0 {
            return None;
        }
        let index = offset / buffer_size;
        (index < self.objects).then_some(index)
    }

    pub fn free_count(&self) -> usize {
        self.objects - self.inuse
    }

    /// The list this slab belongs on given its occupancy.
    pub fn expected_state(&self) -> SlabState {
        if self.inuse == 0 {
            SlabState::Empty
        } else if self.inuse == self.objects {
            SlabState::Full
        } else {
            SlabState::Partial
        }
    }

    /// Take the first free slot off the chain.
    pub fn get_obj(&mut self, buffer_size: usize) -> Option<usize> {
        if self.free == BUFCTL_END {
            return None;
        }
        let index = self.free as usize;
        self.free = self.bufctl.get(index);
        self.bufctl.set(index, BUFCTL_ACTIVE);
        self.inuse += 1;
        Some(self.slot_addr(index, buffer_size))
    }

    /// Return the slot at `addr` to the head of the chain.
    pub fn put_obj(&mut self, addr: usize, buffer_size: usize) -> Result<(), SlabFault> {
        let index = self
            .slot_index(addr, buffer_size)
            .ok_or(SlabFault::BadAddress)?;
        if self.bufctl.get(index) != BUFCTL_ACTIVE {
            return Err(SlabFault::DoubleFree);
        }
        self.bufctl.set(index, self.free);
        self.free = index as u32;
        self.inuse -= 1;
        Ok(())
    }

    /// Indices on the free chain, in chain order.
    ///
    /// Returns `None` if the chain leaves the slot range, runs into an
    /// allocated slot, or is longer than the slab.
    pub fn free_chain(&self) -> Option<Vec<usize>> {
        let mut chain = Vec::with_capacity(self.free_count());
        let mut cursor = self.free;
        while cursor != BUFCTL_END {
            let index = cursor as usize;
            if index >= self.objects || chain.len() == self.objects {
                return None;
            }
            chain.push(index);
            cursor = self.bufctl.get(index);
            if cursor == BUFCTL_ACTIVE {
                return None;
            }
        }
        Some(chain)
    }
}
