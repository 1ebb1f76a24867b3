//! Direct-mapped projection of the block index, keyed by virtual PC.
//!
//! This is the structure the dispatch loop actually probes. It holds no
//! ownership: entries are (tag, code handle) pairs copied out of the index,
//! dropped wholesale whenever coherency demands it.

use crate::arena::CodeRef;
use crate::features::FeatureSet;
use crate::INSTR_SHIFT;

const RESIDENT_BITS: usize = 10;
const RESIDENT_SLOTS: usize = 1 << RESIDENT_BITS;

const INVALID_TAG: u64 = u64::MAX;

#[derive(Clone, Copy)]
struct Entry {
    tag: u64,
    code: CodeRef,
    /// Packed feature masks captured at insert time, checked against the
    /// active set's available mask on feature change.
    required_mask: u64,
    level_mask: u64,
}

const EMPTY: Entry = Entry {
    tag: INVALID_TAG,
    code: CodeRef::DANGLING,
    required_mask: 0,
    level_mask: 0,
};

pub struct ResidentBlockCache {
    slots: Box<[Entry; RESIDENT_SLOTS]>,
}

impl Default for ResidentBlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResidentBlockCache {
    pub fn new() -> Self {
        Self {
            slots: Box::new([EMPTY; RESIDENT_SLOTS]),
        }
    }

    #[inline]
    fn slot_of(pc: u64) -> usize {
        (pc >> INSTR_SHIFT) as usize % RESIDENT_SLOTS
    }

    #[inline]
    pub fn lookup(&self, pc: u64) -> Option<CodeRef> {
        let entry = &self.slots[Self::slot_of(pc)];
        (entry.tag == pc).then_some(entry.code)
    }

    /// Install `code` for `pc`, displacing whatever aliased into the slot.
    pub fn insert(&mut self, pc: u64, code: CodeRef, required: &FeatureSet) {
        debug_assert_ne!(pc, INVALID_TAG);
        self.slots[Self::slot_of(pc)] = Entry {
            tag: pc,
            code,
            required_mask: required.required_mask(),
            level_mask: required.level_mask(),
        };
    }

    /// Drop the single slot `pc` maps to, whatever it currently holds.
    pub fn evict(&mut self, pc: u64) {
        self.slots[Self::slot_of(pc)] = EMPTY;
    }

    pub fn invalidate(&mut self) {
        self.slots.fill(EMPTY);
    }

    /// Drop every entry whose feature requirement is not met by the new
    /// available set. Entries with no requirement survive.
    pub fn invalidate_features(&mut self, available_mask: u64) {
        for entry in self.slots.iter_mut() {
            if entry.tag != INVALID_TAG && available_mask & entry.required_mask != entry.level_mask {
                *entry = EMPTY;
            }
        }
    }
}
