//! The cache-wide state guarded by the cache lock: the slab arena and the
//! full/partial/empty lists threaded through it.

use alloc::vec::Vec;

use super::slab_node::{Slab, SlabState};
use crate::page_map::SlabId;
#[cfg(feature = "tracking")]
use crate::stats::CacheCounters;

fn node(slabs: &mut [Option<Slab>], id: SlabId) -> &mut Slab {
    match slabs.get_mut(id.index()).and_then(Option::as_mut) {
        Some(slab) => slab,
        None => panic!("slab list: dangling slab id {}", id.0),
    }
}

/// Doubly linked list of arena slots, linked through `Slab::prev`/`Slab::next`.
struct SlabList {
    head: Option<SlabId>,
    tail: Option<SlabId>,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn push_back(&mut self, slabs: &mut [Option<Slab>], id: SlabId) {
        let slab = node(slabs, id);
        slab.prev = self.tail;
        slab.next = None;

        if let Some(tail) = self.tail {
            node(slabs, tail).next = Some(id);
        } else {
            self.head = Some(id);
        }

        self.tail = Some(id);
        self.len += 1;
    }

    fn push_front(&mut self, slabs: &mut [Option<Slab>], id: SlabId) {
        let slab = node(slabs, id);
        slab.prev = None;
        slab.next = self.head;

        if let Some(head) = self.head {
            node(slabs, head).prev = Some(id);
        } else {
            self.tail = Some(id);
        }

        self.head = Some(id);
        self.len += 1;
    }

    fn remove(&mut self, slabs: &mut [Option<Slab>], id: SlabId) {
        let slab = node(slabs, id);
        let prev = slab.prev.take();
        let next = slab.next.take();

        if let Some(prev) = prev {
            node(slabs, prev).next = next;
        } else {
            self.head = next;
        }

        if let Some(next) = next {
            node(slabs, next).prev = prev;
        } else {
            self.tail = prev;
        }

        self.len = self.len.saturating_sub(1);
    }
}

pub(crate) struct CacheLists {
    slabs: Vec<Option<Slab>>,
    vacant: Vec<SlabId>,
    full: SlabList,
    partial: SlabList,
    empty: SlabList,
    /// Free slots across the partial and empty lists.
    pub free_objects: usize,
    /// Soft ceiling on `free_objects`; empty slabs beyond it are released.
    pub free_limit: usize,
    pub colour_next: usize,
    /// Set when a refill had to dip into the empty list.
    pub free_touched: bool,
    pub next_reap: u64,
    /// Per-CPU sizing every CPU buffer currently uses.
    pub limit: usize,
    pub batchcount: usize,
    #[cfg(feature = "tracking")]
    pub counters: CacheCounters,
}

impl CacheLists {
    pub fn new(free_limit: usize, limit: usize, batchcount: usize) -> Self {
        Self {
            slabs: Vec::new(),
            vacant: Vec::new(),
            full: SlabList::new(),
            partial: SlabList::new(),
            empty: SlabList::new(),
            free_objects: 0,
            free_limit,
            colour_next: 0,
            free_touched: false,
            next_reap: 0,
            limit,
            batchcount,
            #[cfg(feature = "tracking")]
            counters: CacheCounters::default(),
        }
    }

    fn list_mut(&mut self, state: SlabState) -> (&mut SlabList, &mut [Option<Slab>]) {
        let list = match state {
            SlabState::Empty => &mut self.empty,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        };
        (list, &mut self.slabs)
    }

    fn list(&self, state: SlabState) -> &SlabList {
        match state {
            SlabState::Empty => &self.empty,
            SlabState::Partial => &self.partial,
            SlabState::Full => &self.full,
        }
    }

    /// Place a freshly built slab at the front of the list its occupancy picks.
    pub fn insert(&mut self, mut slab: Slab) -> SlabId {
        slab.state = slab.expected_state();
        let state = slab.state;
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slabs[id.index()] = Some(slab);
                id
            }
            None => {
                self.slabs.push(Some(slab));
                SlabId((self.slabs.len() - 1) as u32)
            }
        };
        let (list, slabs) = self.list_mut(state);
        list.push_front(slabs, id);
        id
    }

    /// Unlink a slab and hand it back to the caller for destruction.
    pub fn take(&mut self, id: SlabId) -> Option<Slab> {
        let state = self.slab(id)?.state;
        let (list, slabs) = self.list_mut(state);
        list.remove(slabs, id);
        let slab = self.slabs[id.index()].take();
        self.vacant.push(id);
        slab
    }

    pub fn slab(&self, id: SlabId) -> Option<&Slab> {
        self.slabs.get(id.index()).and_then(Option::as_ref)
    }

    pub fn slab_mut(&mut self, id: SlabId) -> Option<&mut Slab> {
        self.slabs.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Move a slab to the list matching its occupancy.
    ///
    /// Slabs that just became empty go to the front, where refills look
    /// first; the reaper takes from the back.
    pub fn relink(&mut self, id: SlabId) {
        let Some(slab) = self.slab(id) else {
            return;
        };
        let (from, to) = (slab.state, slab.expected_state());
        if from == to {
            return;
        }

        let (list, slabs) = self.list_mut(from);
        list.remove(slabs, id);
        node(&mut self.slabs, id).state = to;
        let (list, slabs) = self.list_mut(to);
        if to == SlabState::Empty {
            list.push_front(slabs, id);
        } else {
            list.push_back(slabs, id);
        }
    }

    pub fn first(&self, state: SlabState) -> Option<SlabId> {
        self.list(state).head
    }

    pub fn last(&self, state: SlabState) -> Option<SlabId> {
        self.list(state).tail
    }

    pub fn count(&self, state: SlabState) -> usize {
        self.list(state).len
    }

    pub fn total_slabs(&self) -> usize {
        self.full.len + self.partial.len + self.empty.len
    }

    /// Slab ids on one list, head first.
    pub fn ids(&self, state: SlabState) -> Vec<SlabId> {
        let mut ids = Vec::with_capacity(self.count(state));
        let mut cursor = self.first(state);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.slab(id).and_then(|slab| slab.next);
            if ids.len() > self.slabs.len() {
                break;
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlabConfig;
    use crate::slab::geometry::{self, SlabGeometry};
    use crate::PageBlock;
    use alloc::alloc::{alloc, dealloc};
    use alloc::vec;
    use core::alloc::Layout;

    const PAGE: usize = 4096;

    struct Arena {
        geometry: SlabGeometry,
        blocks: Vec<usize>,
    }

    impl Arena {
        fn new() -> Self {
            Self {
                geometry: geometry::compute(512, 8, PAGE, &SlabConfig::new()).unwrap(),
                blocks: Vec::new(),
            }
        }

        fn layout(&self) -> Layout {
            Layout::from_size_align(self.geometry.slab_bytes(PAGE), PAGE).unwrap()
        }

        fn slab(&mut self) -> Slab {
            let addr = unsafe { alloc(self.layout()) } as usize;
            assert_ne!(addr, 0);
            self.blocks.push(addr);
            Slab::new(PageBlock { addr }, 0, &self.geometry)
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            let layout = self.layout();
            for &addr in &self.blocks {
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }

    #[test]
    fn test_slabs_move_between_lists() {
        let mut arena = Arena::new();
        let objects = arena.geometry.objects;
        let mut lists = CacheLists::new(0, 1, 1);

        let id = lists.insert(arena.slab());
        assert_eq!(lists.count(SlabState::Empty), 1);

        let obj = lists.slab_mut(id).unwrap().get_obj(512).unwrap();
        lists.relink(id);
        assert_eq!(lists.count(SlabState::Empty), 0);
        assert_eq!(lists.count(SlabState::Partial), 1);

        while lists.slab_mut(id).unwrap().get_obj(512).is_some() {}
        lists.relink(id);
        assert_eq!(lists.first(SlabState::Full), Some(id));
        assert_eq!(lists.slab(id).unwrap().inuse, objects);

        lists.slab_mut(id).unwrap().put_obj(obj, 512).unwrap();
        lists.relink(id);
        assert_eq!(lists.first(SlabState::Partial), Some(id));
        assert_eq!(lists.total_slabs(), 1);
    }

    #[test]
    fn test_emptied_slabs_go_to_the_front() {
        let mut arena = Arena::new();
        let mut lists = CacheLists::new(0, 1, 1);

        let a = lists.insert(arena.slab());
        let b = lists.insert(arena.slab());
        assert_eq!(lists.ids(SlabState::Empty), vec![b, a]);

        let obj = lists.slab_mut(a).unwrap().get_obj(512).unwrap();
        lists.relink(a);
        assert_eq!(lists.ids(SlabState::Empty), vec![b]);

        lists.slab_mut(a).unwrap().put_obj(obj, 512).unwrap();
        lists.relink(a);
        assert_eq!(lists.first(SlabState::Empty), Some(a));
        assert_eq!(lists.last(SlabState::Empty), Some(b));
    }

    #[test]
    fn test_take_recycles_ids() {
        let mut arena = Arena::new();
        let mut lists = CacheLists::new(0, 1, 1);

        let a = lists.insert(arena.slab());
        let b = lists.insert(arena.slab());
        assert!(lists.take(a).is_some());
        assert!(lists.take(a).is_none());
        assert_eq!(lists.ids(SlabState::Empty), vec![b]);

        let c = lists.insert(arena.slab());
        assert_eq!(c, a);
        assert_eq!(lists.total_slabs(), 2);
    }
}
