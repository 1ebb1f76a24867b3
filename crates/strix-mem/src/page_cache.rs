//! Alternative translation backend: one host-pointer slot per guest page.
//!
//! Unlike the ATC this table has no conflict misses (every guest page has its
//! own slot), at the cost of a large, mostly-empty array. Invalidation is the
//! expensive operation, so it is pluggable: eagerly zero the whole table, or
//! revoke host page protection on the table itself and repair only the 4 KiB
//! host pages that are touched again, amortizing the flush across first-use.

use crate::{page_index, HostPage};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Host page geometry of the slot table itself (not of guest pages).
const HOST_PAGE_SIZE: usize = 4096;
const SLOT_SIZE: usize = std::mem::size_of::<Option<HostPage>>();
const SLOTS_PER_HOST_PAGE: usize = HOST_PAGE_SIZE / SLOT_SIZE;

const _: () = {
    // A zeroed slot must read back as "absent".
    assert!(SLOT_SIZE == 8);
    assert!(HOST_PAGE_SIZE % SLOT_SIZE == 0);
};

/// The raw slot array: page-aligned so protection-based invalidation can flip
/// access on it, zero-initialized so an all-zero slot means "absent".
pub struct SlotTable {
    base: NonNull<u8>,
    slots: usize,
    bytes: usize,
}

impl SlotTable {
    fn new(slots: usize) -> Self {
        let bytes = (slots * SLOT_SIZE).div_ceil(HOST_PAGE_SIZE) * HOST_PAGE_SIZE;
        let layout = Layout::from_size_align(bytes, HOST_PAGE_SIZE).expect("slot table layout");
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("slot table allocation failed");
        Self { base, slots, bytes }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut Option<HostPage> {
        debug_assert!(index < self.slots);
        unsafe { (self.base.as_ptr() as *mut Option<HostPage>).add(index) }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<HostPage> {
        unsafe { self.slot_ptr(index).read() }
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Option<HostPage>) {
        unsafe { self.slot_ptr(index).write(value) }
    }

    fn zero_all(&mut self) {
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, self.bytes) };
    }

    /// Zero one 4 KiB host page of the table (covers `SLOTS_PER_HOST_PAGE`
    /// guest-page slots at once).
    fn zero_host_page(&mut self, host_page: usize) {
        debug_assert!(host_page < self.bytes / HOST_PAGE_SIZE);
        unsafe {
            std::ptr::write_bytes(
                self.base.as_ptr().add(host_page * HOST_PAGE_SIZE),
                0,
                HOST_PAGE_SIZE,
            );
        }
    }
}

impl Drop for SlotTable {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.bytes, HOST_PAGE_SIZE).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// How a flush is realized against the slot table.
///
/// The two implementations are functionally equivalent; the lazy one defers
/// the clearing cost from invalidation time to first-use time.
pub trait InvalidationStrategy {
    fn flush(&mut self, table: &mut SlotTable);

    /// Make the host page covering `slot` accessible before the cache reads
    /// or writes it, repairing lazily invalidated state. No-op for eager
    /// strategies.
    fn prepare_slot(&mut self, table: &mut SlotTable, slot: usize);

    /// Entry point for a host protection-fault handler that observed a fault
    /// at `fault_addr` inside the table. Returns true if the fault was ours
    /// and has been repaired (the faulting access can be restarted). Must not
    /// allocate: it runs inside the host's fault-handling path.
    fn handle_protection_fault(&mut self, table: &mut SlotTable, fault_addr: usize) -> bool;

    /// Restore full access before the table is deallocated.
    fn restore(&mut self, table: &mut SlotTable);
}

/// Bulk-zero the table on every flush. Portable default.
#[derive(Debug, Default)]
pub struct EagerClear;

impl InvalidationStrategy for EagerClear {
    fn flush(&mut self, table: &mut SlotTable) {
        table.zero_all();
    }

    fn prepare_slot(&mut self, _table: &mut SlotTable, _slot: usize) {}

    fn handle_protection_fault(&mut self, _table: &mut SlotTable, _fault_addr: usize) -> bool {
        false
    }

    fn restore(&mut self, _table: &mut SlotTable) {}
}

/// Revoke access to the table on flush; repair per host page on reuse.
///
/// `prepare_slot` performs the repair for the safe lookup/install path;
/// `handle_protection_fault` serves hosts that let generated code access the
/// raw table (via [`PageCache::table_ptr`]) and field the SIGSEGV themselves.
#[cfg(unix)]
pub struct LazyProtect {
    /// One flag per host page of the table. Preallocated: the fault hook
    /// must not allocate.
    protected: Vec<bool>,
}

#[cfg(unix)]
impl LazyProtect {
    pub fn new(table: &SlotTable) -> Self {
        Self {
            protected: vec![false; table.byte_len() / HOST_PAGE_SIZE],
        }
    }

    fn mprotect(table: &SlotTable, offset: usize, len: usize, prot: libc::c_int) {
        let rc = unsafe {
            libc::mprotect(table.base_ptr().add(offset) as *mut libc::c_void, len, prot)
        };
        assert_eq!(rc, 0, "mprotect failed on slot table");
    }

    fn repair(&mut self, table: &mut SlotTable, host_page: usize) {
        Self::mprotect(
            table,
            host_page * HOST_PAGE_SIZE,
            HOST_PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        table.zero_host_page(host_page);
        self.protected[host_page] = false;
    }
}

#[cfg(unix)]
impl InvalidationStrategy for LazyProtect {
    fn flush(&mut self, table: &mut SlotTable) {
        Self::mprotect(table, 0, table.byte_len(), libc::PROT_NONE);
        self.protected.fill(true);
    }

    fn prepare_slot(&mut self, table: &mut SlotTable, slot: usize) {
        let host_page = slot / SLOTS_PER_HOST_PAGE;
        if self.protected[host_page] {
            self.repair(table, host_page);
        }
    }

    fn handle_protection_fault(&mut self, table: &mut SlotTable, fault_addr: usize) -> bool {
        let base = table.base_ptr() as usize;
        if fault_addr < base || fault_addr >= base + table.byte_len() {
            return false;
        }
        let host_page = (fault_addr - base) / HOST_PAGE_SIZE;
        if !self.protected[host_page] {
            return false;
        }
        self.repair(table, host_page);
        true
    }

    fn restore(&mut self, table: &mut SlotTable) {
        Self::mprotect(
            table,
            0,
            table.byte_len(),
            libc::PROT_READ | libc::PROT_WRITE,
        );
        self.protected.fill(false);
    }
}

/// Direct-mapped per-page host-pointer cache covering a full guest address
/// space. Owned by the per-thread simulation state; lives exactly as long as
/// that execution context.
pub struct PageCache {
    table: SlotTable,
    strategy: Box<dyn InvalidationStrategy>,
}

impl PageCache {
    /// `guest_address_bits` bounds the covered address space; one 8-byte slot
    /// is allocated per guest page (e.g. 32 bits → 2^20 slots, 8 MiB).
    pub fn new(guest_address_bits: u32, strategy: Box<dyn InvalidationStrategy>) -> Self {
        let slots = 1usize << (guest_address_bits - crate::PAGE_BITS);
        Self {
            table: SlotTable::new(slots),
            strategy,
        }
    }

    pub fn new_eager(guest_address_bits: u32) -> Self {
        Self::new(guest_address_bits, Box::new(EagerClear))
    }

    #[cfg(unix)]
    pub fn new_lazy(guest_address_bits: u32) -> Self {
        let slots = 1usize << (guest_address_bits - crate::PAGE_BITS);
        let table = SlotTable::new(slots);
        let strategy = Box::new(LazyProtect::new(&table));
        Self { table, strategy }
    }

    /// Host base address for the page containing `vaddr`, or `None` when the
    /// slot is absent (caller performs the full translation and installs).
    /// Out-of-range addresses are always absent.
    #[inline]
    pub fn lookup(&mut self, vaddr: u64) -> Option<HostPage> {
        let index = page_index(vaddr) as usize;
        if index >= self.table.len() {
            return None;
        }
        self.strategy.prepare_slot(&mut self.table, index);
        self.table.get(index)
    }

    pub fn install(&mut self, vaddr: u64, host: HostPage) {
        let index = page_index(vaddr) as usize;
        if index >= self.table.len() {
            return;
        }
        self.strategy.prepare_slot(&mut self.table, index);
        self.table.set(index, Some(host));
    }

    pub fn evict(&mut self, vaddr: u64) {
        let index = page_index(vaddr) as usize;
        if index >= self.table.len() {
            return;
        }
        self.strategy.prepare_slot(&mut self.table, index);
        self.table.set(index, None);
    }

    pub fn flush(&mut self) {
        log::debug!("flushing page cache ({} slots)", self.table.len());
        self.strategy.flush(&mut self.table);
    }

    /// Forwarded to the strategy; see
    /// [`InvalidationStrategy::handle_protection_fault`].
    pub fn handle_protection_fault(&mut self, fault_addr: usize) -> bool {
        self.strategy
            .handle_protection_fault(&mut self.table, fault_addr)
    }

    /// Raw table pointer and byte length, for hosts that wire the table into
    /// generated code and register their own fault handler over it.
    pub fn table_ptr(&self) -> (*mut u8, usize) {
        (self.table.base_ptr(), self.table.byte_len())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.strategy.restore(&mut self.table);
    }
}
