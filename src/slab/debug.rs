//! Redzone and poison instrumentation.
//!
//! A slot of a red-zoned cache looks like
//!
//! ```text
//! | leading word | object (size bytes) | trailing word | padding |
//! ```
//!
//! The trailing word starts right at the object's nominal end, so it is
//! written unaligned. Free slots carry [`RED_INACTIVE`] in both words and
//! allocated ones [`RED_ACTIVE`]. Poisoned caches fill free objects with
//! [`POISON_FREE`] (last byte [`POISON_END`]) and allocated ones with
//! [`POISON_INUSE`].

use alloc::string::String;
use core::fmt;

#[cfg(feature = "log")]
use log::error;

use crate::WORD_SIZE;

pub const RED_INACTIVE: usize = 0x09F9_1102_9D74_E35B_u64 as usize;
pub const RED_ACTIVE: usize = 0xD841_56C5_6356_88C0_u64 as usize;

pub const POISON_INUSE: u8 = 0x5a;
pub const POISON_FREE: u8 = 0x6b;
pub const POISON_END: u8 = 0xa5;

/// Which guard caught the corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    LeadingRedZone,
    TrailingRedZone,
    Poison,
    DoubleFree,
    /// The pointer does not belong to the cache it was freed to.
    ForeignObject,
    /// The pointer is not a slot boundary of its slab.
    BadAddress,
}

/// Everything known about one detected corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub cache: String,
    /// Address of the object as handed to the caller.
    pub object: usize,
    pub kind: GuardKind,
    /// Byte offset of the failed check from the start of the slot.
    pub offset: usize,
    pub expected: usize,
    pub found: usize,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slab corruption in cache `{}`: object {:#x}, {:?} at slot offset {}: expected {:#x}, found {:#x}",
            self.cache, self.object, self.kind, self.offset, self.expected, self.found
        )
    }
}

/// A failed check, before the cache fills in its name and the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GuardFault {
    pub kind: GuardKind,
    pub offset: usize,
    pub expected: usize,
    pub found: usize,
}

impl GuardFault {
    pub fn new(kind: GuardKind) -> Self {
        Self {
            kind,
            offset: 0,
            expected: 0,
            found: 0,
        }
    }

    pub fn into_report(self, cache: &str, object: usize) -> CorruptionReport {
        CorruptionReport {
            cache: String::from(cache),
            object,
            kind: self.kind,
            offset: self.offset,
            expected: self.expected,
            found: self.found,
        }
    }
}

/// Log the report and stop.
#[cold]
pub(crate) fn report_corruption(report: CorruptionReport) -> ! {
    error!("{}", report);
    panic!("{}", report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DebugLayout {
    pub redzone: bool,
    pub poison: bool,
    /// Requested object size.
    pub obj_size: usize,
}

impl DebugLayout {
    pub fn new(redzone: bool, poison: bool, obj_size: usize) -> Self {
        Self {
            redzone,
            poison,
            obj_size,
        }
    }

    pub fn enabled(&self) -> bool {
        self.redzone || self.poison
    }

    /// Distance from the slot start to the object.
    pub fn obj_offset(&self) -> usize {
        if self.redzone {
            WORD_SIZE
        } else {
            0
        }
    }

    /// Unpadded bytes a slot needs.
    pub fn slot_size(&self) -> usize {
        if self.redzone {
            self.obj_size + 2 * WORD_SIZE
        } else {
            self.obj_size
        }
    }

    fn trailing_offset(&self) -> usize {
        WORD_SIZE + self.obj_size
    }

    fn read_word(slot: usize, offset: usize) -> usize {
        // SAFETY: callers only pass slots of a slab they own, and every offset
        // used here lies within the slot.
        unsafe { ((slot + offset) as *const usize).read_unaligned() }
    }

    fn write_word(slot: usize, offset: usize, value: usize) {
        // SAFETY: see `read_word`.
        unsafe { ((slot + offset) as *mut usize).write_unaligned(value) }
    }

    fn check_redzones(&self, slot: usize, expected: usize) -> Result<(), GuardFault> {
        let leading = Self::read_word(slot, 0);
        let trailing = Self::read_word(slot, self.trailing_offset());
        if leading == expected && trailing == expected {
            return Ok(());
        }

        let (kind, offset, found) = if expected == RED_ACTIVE
            && leading == RED_INACTIVE
            && trailing == RED_INACTIVE
        {
            (GuardKind::DoubleFree, 0, leading)
        } else if leading != expected {
            (GuardKind::LeadingRedZone, 0, leading)
        } else {
            (GuardKind::TrailingRedZone, self.trailing_offset(), trailing)
        };
        Err(GuardFault {
            kind,
            offset,
            expected,
            found,
        })
    }

    fn set_redzones(&self, slot: usize, value: usize) {
        Self::write_word(slot, 0, value);
        Self::write_word(slot, self.trailing_offset(), value);
    }

    fn object_ptr(&self, slot: usize) -> *mut u8 {
        (slot + self.obj_offset()) as *mut u8
    }

    fn fill_object(&self, slot: usize, byte: u8) {
        // SAFETY: the object area of a slot is `obj_size` bytes owned by the
        // slab while the slot is being filled.
        unsafe { core::ptr::write_bytes(self.object_ptr(slot), byte, self.obj_size) }
    }

    fn poison_free(&self, slot: usize) {
        self.fill_object(slot, POISON_FREE);
        // SAFETY: `obj_size` is at least one word.
        unsafe { self.object_ptr(slot).add(self.obj_size - 1).write(POISON_END) }
    }

    fn check_poison(&self, slot: usize) -> Result<(), GuardFault> {
        // SAFETY: see `fill_object`.
        let bytes = unsafe { core::slice::from_raw_parts(self.object_ptr(slot), self.obj_size) };
        let last = bytes.len() - 1;
        for (i, &byte) in bytes.iter().enumerate() {
            let expected = if i == last { POISON_END } else { POISON_FREE };
            if byte != expected {
                return Err(GuardFault {
                    kind: GuardKind::Poison,
                    offset: self.obj_offset() + i,
                    expected: expected as usize,
                    found: byte as usize,
                });
            }
        }
        Ok(())
    }

    /// Put a freshly carved slot into the free state.
    pub fn init_slot(&self, slot: usize) {
        if self.redzone {
            self.set_redzones(slot, RED_INACTIVE);
        }
        if self.poison {
            self.poison_free(slot);
        }
    }

    /// Check a slot leaving the cache and mark it allocated.
    pub fn on_alloc(&self, slot: usize) -> Result<(), GuardFault> {
        if self.poison {
            self.check_poison(slot)?;
            self.fill_object(slot, POISON_INUSE);
        }
        if self.redzone {
            self.check_redzones(slot, RED_INACTIVE)?;
            self.set_redzones(slot, RED_ACTIVE);
        }
        Ok(())
    }

    /// Check a slot coming back from the caller and mark it free.
    pub fn on_free(&self, slot: usize) -> Result<(), GuardFault> {
        if self.redzone {
            self.check_redzones(slot, RED_ACTIVE)?;
            self.set_redzones(slot, RED_INACTIVE);
        }
        if self.poison {
            self.poison_free(slot);
        }
        Ok(())
    }

    /// Check a slot that should be free without changing it.
    pub fn check_free_slot(&self, slot: usize) -> Result<(), GuardFault> {
        if self.redzone {
            self.check_redzones(slot, RED_INACTIVE)?;
        }
        if self.poison {
            self.check_poison(slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn slot_for(layout: &DebugLayout) -> alloc::vec::Vec<usize> {
        vec![0usize; layout.slot_size() / WORD_SIZE + 2]
    }

    #[test]
    fn test_redzone_lifecycle() {
        let layout = DebugLayout::new(true, false, 40);
        let mut buf = slot_for(&layout);
        let slot = buf.as_mut_ptr() as usize;

        layout.init_slot(slot);
        assert_eq!(layout.check_free_slot(slot), Ok(()));
        assert_eq!(layout.on_alloc(slot), Ok(()));
        assert_eq!(layout.on_free(slot), Ok(()));

        let fault = layout.on_free(slot).unwrap_err();
        assert_eq!(fault.kind, GuardKind::DoubleFree);
    }

    #[test]
    fn test_overflow_hits_trailing_redzone() {
        // 13 bytes leaves the trailing word unaligned.
        let layout = DebugLayout::new(true, false, 13);
        let mut buf = slot_for(&layout);
        let slot = buf.as_mut_ptr() as usize;

        layout.init_slot(slot);
        layout.on_alloc(slot).unwrap();
        unsafe { ((slot + layout.obj_offset() + 13) as *mut u8).write(0) };

        let fault = layout.on_free(slot).unwrap_err();
        assert_eq!(fault.kind, GuardKind::TrailingRedZone);
        assert_eq!(fault.offset, WORD_SIZE + 13);
        assert_eq!(fault.expected, RED_ACTIVE);
    }

    #[test]
    fn test_underflow_hits_leading_redzone() {
        let layout = DebugLayout::new(true, false, 16);
        let mut buf = slot_for(&layout);
        let slot = buf.as_mut_ptr() as usize;

        layout.init_slot(slot);
        layout.on_alloc(slot).unwrap();
        unsafe { ((slot + WORD_SIZE - 1) as *mut u8).write(0) };
        assert_eq!(
            layout.on_free(slot).unwrap_err().kind,
            GuardKind::LeadingRedZone
        );
    }

    #[test]
    fn test_poison_catches_use_after_free() {
        let layout = DebugLayout::new(false, true, 32);
        let mut buf = slot_for(&layout);
        let slot = buf.as_mut_ptr() as usize;

        layout.init_slot(slot);
        layout.on_alloc(slot).unwrap();
        let object = unsafe { core::slice::from_raw_parts(slot as *const u8, 32) };
        assert!(object.iter().all(|&b| b == POISON_INUSE));
        layout.on_free(slot).unwrap();
        let object = unsafe { core::slice::from_raw_parts(slot as *const u8, 32) };
        assert_eq!(object[0], POISON_FREE);
        assert_eq!(object[31], POISON_END);

        unsafe { ((slot + 5) as *mut u8).write(0x11) };
        let fault = layout.on_alloc(slot).unwrap_err();
        assert_eq!(fault.kind, GuardKind::Poison);
        assert_eq!(fault.offset, 5);
        assert_eq!(fault.expected, POISON_FREE as usize);
        assert_eq!(fault.found, 0x11);
    }

    #[test]
    fn test_report_mentions_cache_and_guard() {
        let report = GuardFault::new(GuardKind::ForeignObject).into_report("inode", 0x4000);
        let text = alloc::format!("{}", report);
        assert!(text.contains("inode"));
        assert!(text.contains("ForeignObject"));
        assert!(text.contains("0x4000"));
    }
}
