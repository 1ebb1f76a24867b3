//! Guest ISA feature levels and their packed mask encoding.
//!
//! A compiled block records the feature levels its translation assumed; the
//! resident cache re-checks them with three packed `u64` masks so the drop
//! scan is a mask-compare per entry. Features 0..7 occupy one 8-bit field
//! each; any feature with a higher id sets the top field to all-ones, which
//! can never match an available mask, forcing conservative invalidation.

use std::collections::BTreeMap;

const TOP_FIELD: u64 = 0xf000_0000_0000_0000;
const PACKED_FEATURES: u32 = 7;

/// A set of (feature id → level) pairs.
///
/// Used both as "what is currently enabled on this thread" and as "what a
/// translation requires"; the two meanings meet in [`FeatureSet::satisfies`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    levels: BTreeMap<u32, u32>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&mut self, feature: u32, level: u32) {
        self.levels.insert(feature, level);
    }

    pub fn level(&self, feature: u32) -> Option<u32> {
        self.levels.get(&feature).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Does this (active) set satisfy `required`? Levels must match exactly:
    /// a translation made at feature level 1 is wrong both below and above.
    pub fn satisfies(&self, required: &FeatureSet) -> bool {
        required
            .levels
            .iter()
            .all(|(feature, level)| self.level(*feature) == Some(*level))
    }

    /// Packed levels of every feature currently in the set. The top field is
    /// always zero: ids above the packed range cannot be expressed as
    /// "available" and are skipped.
    pub fn available_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (&feature, &level) in &self.levels {
            if feature >= PACKED_FEATURES {
                continue;
            }
            mask |= u64::from(level & 0xff) << (feature * 8);
        }
        debug_assert_eq!(mask & TOP_FIELD, 0);
        mask
    }

    /// All-ones field per required feature (which features matter, not their
    /// levels). Unpackable ids set the top field.
    pub fn required_mask(&self) -> u64 {
        let mut mask = 0u64;
        for &feature in self.levels.keys() {
            if feature >= PACKED_FEATURES {
                mask |= TOP_FIELD;
                continue;
            }
            mask |= 0xffu64 << (feature * 8);
        }
        mask
    }

    /// Packed required levels; unpackable ids set the top field, which no
    /// available mask ever carries.
    pub fn level_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (&feature, &level) in &self.levels {
            if feature >= PACKED_FEATURES {
                mask |= TOP_FIELD;
                continue;
            }
            mask |= u64::from(level & 0xff) << (feature * 8);
        }
        mask
    }
}
