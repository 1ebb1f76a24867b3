//! Guest-memory caching layer for the DBT core.
//!
//! A simulated memory access costs a full page-table walk plus a device
//! lookup if taken cold. This crate caches the result of that work in two
//! structures so the hot path is a single direct-mapped probe:
//!
//! - [`Atc`]: a software address-translation cache mapping guest virtual
//!   pages to host-resident memory or device handles, one instance per
//!   (read/write × user/kernel) combination, orchestrated by
//!   [`CachedMemory`].
//! - [`PageCache`]: an alternative flat per-page host-pointer table with
//!   pluggable (eager or lazy, protection-fault driven) invalidation.
//!
//! Neither cache is ever authoritative: everything here can be rebuilt from
//! the MMU and device manager on demand, and coherency events (TLB
//! maintenance, privilege changes, self-modifying code) invalidate entries
//! through `strix-events`.

mod accessor;
mod atc;
mod page_cache;

pub use accessor::{CachedMemory, MemConfig, WriteReceipt};
pub use atc::{Atc, AtcEntry, AtcFlags, Payload, ATC_SLOTS, INVALID_TAG};
pub use page_cache::{EagerClear, InvalidationStrategy, PageCache};
#[cfg(unix)]
pub use page_cache::LazyProtect;

pub use strix_events::Ring;

use std::ptr::NonNull;
use thiserror::Error;

/// 4 KiB guest pages throughout.
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;
pub const PAGE_BASE_MASK: u64 = !PAGE_OFFSET_MASK;

#[inline]
pub fn page_base(addr: u64) -> u64 {
    addr & PAGE_BASE_MASK
}

#[inline]
pub fn page_index(addr: u64) -> u64 {
    addr >> PAGE_BITS
}

#[inline]
pub fn page_offset(addr: u64) -> u64 {
    addr & PAGE_OFFSET_MASK
}

/// What kind of access is being performed. Fetches are reads that the MMU may
/// permission-check differently (execute permission).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

impl AccessKind {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessKind::Write)
    }
}

/// Full description of a translation request, passed to the MMU collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub kind: AccessKind,
    pub ring: Ring,
    /// When false the walk must not perform guest-visible side effects
    /// (accessed/dirty-bit updates, fault delivery); used by debugger
    /// accesses and cache-only translation probes.
    pub side_effects: bool,
}

impl AccessInfo {
    #[inline]
    pub fn new(kind: AccessKind, ring: Ring) -> Self {
        Self {
            kind,
            ring,
            side_effects: true,
        }
    }

    #[inline]
    pub fn sideless(kind: AccessKind, ring: Ring) -> Self {
        Self {
            kind,
            ring,
            side_effects: false,
        }
    }
}

bitflags::bitflags! {
    /// Page permissions as reported by the MMU for a successful translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagePerms: u8 {
        const USER_READ    = 1 << 0;
        const USER_WRITE   = 1 << 1;
        const KERNEL_READ  = 1 << 2;
        const KERNEL_WRITE = 1 << 3;
    }
}

/// Result of a successful MMU translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    pub perms: PagePerms,
}

/// A failed guest memory access.
///
/// Translation faults propagate to the guest-exception delivery mechanism;
/// they must never leave a freshly cached line behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateFault {
    #[error("no mapping for guest address {vaddr:#x}")]
    NotMapped { vaddr: u64 },
    #[error("{kind:?} access to {vaddr:#x} denied in {ring:?} mode")]
    Denied {
        vaddr: u64,
        ring: Ring,
        kind: AccessKind,
    },
    #[error("physical address {paddr:#x} has no host backing")]
    Unbacked { paddr: u64 },
}

/// Page-table-walking MMU collaborator. Consulted on every cache miss.
pub trait AddressTranslator {
    fn translate(&mut self, vaddr: u64, info: AccessInfo) -> Result<Translation, TranslateFault>;
}

impl<T: AddressTranslator + ?Sized> AddressTranslator for &mut T {
    #[inline]
    fn translate(&mut self, vaddr: u64, info: AccessInfo) -> Result<Translation, TranslateFault> {
        <T as AddressTranslator>::translate(&mut **self, vaddr, info)
    }
}

/// Opaque handle to a memory-mapped device, assigned by the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Device-manager collaborator: device presence and register access.
///
/// Access methods take the full physical address; the device model resolves
/// its own base offset. `size` is 1/2/4/8.
pub trait DeviceBus {
    fn lookup_device(&self, paddr: u64) -> Option<DeviceId>;

    #[inline]
    fn has_device(&self, paddr: u64) -> bool {
        self.lookup_device(paddr).is_some()
    }

    fn device_read(&mut self, dev: DeviceId, paddr: u64, size: u32) -> u64;
    fn device_write(&mut self, dev: DeviceId, paddr: u64, size: u32, value: u64);
}

/// Host memory-region locking collaborator: pins the host page backing a
/// guest physical page and hands back a directly usable pointer.
///
/// The returned page must stay valid and pinned for the lifetime of the
/// execution context that caches it; backing objects are owned by the
/// memory model, never freed through a cache.
pub trait MemoryBacking {
    fn lock_page(&mut self, phys_page_base: u64) -> Option<HostPage>;
}

/// A pinned 4 KiB host page backing one guest physical page.
///
/// Copyable so it can live in cache lines; all accesses are width-explicit
/// and bounds-checked against the page in debug builds. Loads and stores use
/// unaligned host accesses, so any in-page offset is fine.
///
/// `repr(transparent)` over `NonNull<u8>`: `Option<HostPage>` gets the null
/// niche, so a zeroed slot table reads back as all-`None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HostPage(NonNull<u8>);

// The page is plain memory owned by the guest memory model; the cache-owning
// thread is the only one accessing guest state through it.
unsafe impl Send for HostPage {}

impl HostPage {
    /// # Safety
    ///
    /// `base` must point at (at least) `PAGE_SIZE` bytes of readable and
    /// writable memory that outlives every cache holding this handle.
    #[inline]
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self(base)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub fn read(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() as u64 <= PAGE_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.0.as_ptr().add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    #[inline]
    pub fn write(&self, offset: u64, src: &[u8]) {
        debug_assert!(offset + src.len() as u64 <= PAGE_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.0.as_ptr().add(offset as usize),
                src.len(),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util;

#[cfg(test)]
mod tests;
