//! Compiled-code caching for the DBT core.
//!
//! Two structures cooperate on the instruction-dispatch path:
//!
//! - [`BlockIndex`]: the authoritative per-guest-physical-page table of
//!   compiled blocks, invalidated at page granularity (a freed code blob has
//!   no individually targetable instruction boundaries, so a dirty page drops
//!   every block on it).
//! - [`ResidentBlockCache`]: a direct-mapped, PC-tagged projection of the
//!   index consulted on every block boundary; never authoritative, cheap to
//!   drop wholesale.
//!
//! Compiled code lives in a [`CodeArena`] owned by the execution context, so
//! per-thread cache instances stay independent and testable; blocks carry the
//! [`FeatureSet`] their translation assumed, re-checked before any reuse.

mod arena;
mod features;
mod index;
mod resident;

pub use arena::{CodeArena, CodeRef};
pub use features::FeatureSet;
pub use index::{BlockIndex, BlockTranslation, PageProfile};
pub use resident::ResidentBlockCache;

/// 4 KiB guest pages, matching `strix-mem`.
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Minimum guest instruction alignment (bytes = `1 << INSTR_SHIFT`); block
/// entry points are indexed at this granularity.
pub const INSTR_SHIFT: u32 = 1;

#[inline]
pub(crate) fn page_index(addr: u64) -> u64 {
    addr >> PAGE_BITS
}

#[inline]
pub(crate) fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}
