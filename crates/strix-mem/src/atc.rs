//! The address-translation cache: a direct-mapped array of per-page
//! translation lines, analogous to a software TLB.

use crate::{page_base, page_index, DeviceId, HostPage};

/// Reserved tag meaning "this line is invalid". Real tags are page bases, so
/// an all-ones value can never collide with one.
pub const INVALID_TAG: u64 = u64::MAX;

pub const ATC_BITS: u32 = 10;
/// Number of direct-mapped slots per cache instance.
pub const ATC_SLOTS: usize = 1 << ATC_BITS;

// Flush batching: the slot array is divided into 32 groups of 32 slots and a
// bitmap records which groups have been touched since the last flush, so a
// flush only clears groups that can contain valid lines.
const GROUP_BITS: u32 = 5;
const GROUP_COUNT: usize = 1 << GROUP_BITS;
const SLOTS_PER_GROUP: usize = ATC_SLOTS / GROUP_COUNT;

bitflags::bitflags! {
    /// Packed permission flags for one cache line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtcFlags: u8 {
        /// Payload is a device handle, not host memory.
        const DEVICE     = 1 << 0;
        /// Reading this page requires kernel privilege.
        const PRIV_READ  = 1 << 1;
        /// Writing this page requires kernel privilege.
        const PRIV_WRITE = 1 << 2;
        /// This page is writable from user mode.
        const USER_WRITE = 1 << 3;
    }
}

/// What a valid line resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    /// Host page directly usable for same-width loads/stores.
    Ram(HostPage),
    Device(DeviceId),
}

/// One translation-cache line.
///
/// A line is valid iff `virt_tag != INVALID_TAG`; a valid line's tag is the
/// page base of some address looked up since the slot was last invalidated.
#[derive(Debug, Clone, Copy)]
pub struct AtcEntry {
    virt_tag: u64,
    phys_page: u64,
    payload: Payload,
    flags: AtcFlags,
}

impl Default for AtcEntry {
    fn default() -> Self {
        Self {
            virt_tag: INVALID_TAG,
            phys_page: 0,
            payload: Payload::None,
            flags: AtcFlags::empty(),
        }
    }
}

impl AtcEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.virt_tag != INVALID_TAG
    }

    #[inline]
    pub fn is_page_for(&self, vaddr: u64) -> bool {
        page_base(vaddr) == self.virt_tag
    }

    #[inline]
    pub fn is_device(&self) -> bool {
        self.flags.contains(AtcFlags::DEVICE)
    }

    #[inline]
    pub fn flags(&self) -> AtcFlags {
        self.flags
    }

    #[inline]
    pub fn virt_tag(&self) -> u64 {
        self.virt_tag
    }

    /// Physical page base this line translates to.
    #[inline]
    pub fn phys_page(&self) -> u64 {
        self.phys_page
    }

    #[inline]
    pub fn payload(&self) -> Payload {
        self.payload
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.virt_tag = INVALID_TAG;
        self.payload = Payload::None;
        self.flags = AtcFlags::empty();
    }

    /// Install a RAM translation for the page containing `vaddr`.
    #[inline]
    pub fn fill_ram(&mut self, vaddr: u64, phys_page: u64, host: HostPage, flags: AtcFlags) {
        debug_assert!(!flags.contains(AtcFlags::DEVICE));
        self.virt_tag = page_base(vaddr);
        self.phys_page = phys_page;
        self.payload = Payload::Ram(host);
        self.flags = flags;
    }

    /// Install a device translation.
    ///
    /// Device lines keep the invalid tag so device accesses never hit the
    /// cache: every device access re-translates and dispatches exactly once.
    #[inline]
    pub fn fill_device(&mut self, phys_page: u64, dev: DeviceId) {
        self.virt_tag = INVALID_TAG;
        self.phys_page = phys_page;
        self.payload = Payload::Device(dev);
        self.flags = AtcFlags::DEVICE;
    }
}

/// A fixed-capacity, direct-mapped translation cache.
///
/// No associativity and no replacement policy beyond last-writer-wins per
/// slot: two hot pages aliasing the same slot continuously evict each other,
/// trading conflict misses for a branch-light O(1) probe.
#[derive(Debug)]
pub struct Atc {
    slots: Box<[AtcEntry]>,
    /// Anything probed since the last flush?
    dirty: bool,
    /// Bit per slot group; set on probe, cleared by flush.
    dirty_groups: u32,
}

impl Default for Atc {
    fn default() -> Self {
        Self::new()
    }
}

impl Atc {
    pub fn new() -> Self {
        Self {
            slots: vec![AtcEntry::default(); ATC_SLOTS].into_boxed_slice(),
            // Start dirty so the first flush clears everything.
            dirty: true,
            dirty_groups: u32::MAX,
        }
    }

    #[inline]
    fn slot_index(vaddr: u64) -> usize {
        (page_index(vaddr) as usize) % ATC_SLOTS
    }

    /// Probe the slot for `vaddr`. Always returns the line so a miss caller
    /// can fill it in place; `hit` is true iff the tag matches the page base.
    ///
    /// Every probe, hit or miss, marks the slot's group dirty: the caller may
    /// fill the returned line at any point, and flush batching must assume it
    /// did.
    #[inline]
    pub fn probe(&mut self, vaddr: u64) -> (bool, &mut AtcEntry) {
        let index = Self::slot_index(vaddr);
        self.dirty = true;
        self.dirty_groups |= 1 << (index >> (ATC_BITS - GROUP_BITS));
        let entry = &mut self.slots[index];
        let hit = entry.virt_tag == page_base(vaddr);
        (hit, entry)
    }

    /// Invalidate only the slot `vaddr` maps to.
    #[inline]
    pub fn evict(&mut self, vaddr: u64) {
        self.slots[Self::slot_index(vaddr)].invalidate();
    }

    /// Invalidate every valid line.
    ///
    /// Only slot groups touched since the last flush are walked; a clean
    /// cache returns immediately. Calling this twice in a row is the same as
    /// calling it once.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        log::debug!("flushing ATC ({:#010x} dirty groups)", self.dirty_groups);
        self.dirty = false;

        let mut groups = self.dirty_groups;
        self.dirty_groups = 0;
        while groups != 0 {
            let group = groups.trailing_zeros() as usize;
            groups &= groups - 1;
            let start = group * SLOTS_PER_GROUP;
            for entry in &mut self.slots[start..start + SLOTS_PER_GROUP] {
                entry.invalidate();
            }
        }
    }

    /// Number of currently valid lines; test/statistics use only.
    pub fn valid_lines(&self) -> usize {
        self.slots.iter().filter(|e| e.is_valid()).count()
    }
}
