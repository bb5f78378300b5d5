//! Object caches and the slabs behind them.
//!
//! A [`Cache`] hands out objects of one size. Its memory comes in slabs, page
//! blocks carved into slots, and recently freed objects are parked in small
//! per-CPU buffers so the common path never takes the cache lock.

mod array_cache;
pub mod debug;
pub mod geometry;
mod slab_cache;
mod slab_lists;
mod slab_node;

pub use debug::{CorruptionReport, GuardKind};
pub use geometry::SlabGeometry;
pub use slab_cache::{Cache, CacheHandle, ObjectHook};

pub(crate) use slab_cache::{CacheParams, SlabEnv};
