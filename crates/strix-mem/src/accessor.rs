//! Cached system-memory accessor: combines ATC probes with full MMU
//! translation and device dispatch on a miss.

use crate::atc::{Atc, AtcEntry, AtcFlags};
use crate::{
    page_base, page_offset, AccessInfo, AccessKind, AddressTranslator, DeviceBus, MemoryBacking,
    PagePerms, Payload, Ring, TranslateFault, PAGE_SIZE,
};

/// Runtime policy knobs for the accessor.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    /// Decompose *any* unaligned access into byte sub-accesses (the original
    /// simulator's alignment-checking mode). Accesses that straddle a page
    /// boundary are always decomposed regardless of this flag, since a single
    /// host access through one page's pointer cannot cross into the next
    /// guest page. Decomposition stops at the first faulting byte, which can
    /// leave earlier bytes written.
    pub check_alignment: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            check_alignment: true,
        }
    }
}

/// Receipt for a completed cached write: the physical address written, plus
/// the physical page of the tail bytes when the write straddled a page
/// boundary. Callers use this to detect writes landing on code pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub paddr: u64,
    pub straddle_paddr: Option<u64>,
}

impl WriteReceipt {
    #[inline]
    fn single(paddr: u64) -> Self {
        Self {
            paddr,
            straddle_paddr: None,
        }
    }
}

/// The system-memory accessor.
///
/// Holds one [`Atc`] per (read/write × user/kernel) combination. They are
/// kept independent because the permission outcome of a translation differs
/// per combination and must not cross-contaminate; the privilege-change
/// event flushes all four.
pub struct CachedMemory<M, D, P> {
    mmu: M,
    devices: D,
    backing: P,
    read_user: Atc,
    read_kernel: Atc,
    write_user: Atc,
    write_kernel: Atc,
    ring: Ring,
    config: MemConfig,
}

impl<M, D, P> CachedMemory<M, D, P>
where
    M: AddressTranslator,
    D: DeviceBus,
    P: MemoryBacking,
{
    pub fn new(mmu: M, devices: D, backing: P, config: MemConfig) -> Self {
        Self {
            mmu,
            devices,
            backing,
            read_user: Atc::new(),
            read_kernel: Atc::new(),
            write_user: Atc::new(),
            write_kernel: Atc::new(),
            ring: Ring::Kernel,
            config,
        }
    }

    #[inline]
    pub fn ring(&self) -> Ring {
        self.ring
    }

    /// Record the thread's new privilege ring. Does not flush by itself: the
    /// coherency broker delivers the privilege-change flush.
    #[inline]
    pub fn set_ring(&mut self, ring: Ring) {
        self.ring = ring;
    }

    #[inline]
    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    #[inline]
    pub fn devices_mut(&mut self) -> &mut D {
        &mut self.devices
    }

    #[inline]
    pub fn backing_mut(&mut self) -> &mut P {
        &mut self.backing
    }

    /// The ATC instance for one (write, ring) combination; introspection for
    /// tests and statistics.
    pub fn cache(&self, is_write: bool, ring: Ring) -> &Atc {
        match (is_write, ring) {
            (false, Ring::User) => &self.read_user,
            (false, Ring::Kernel) => &self.read_kernel,
            (true, Ring::User) => &self.write_user,
            (true, Ring::Kernel) => &self.write_kernel,
        }
    }

    /// Invalidate every line of all four caches.
    pub fn flush_caches(&mut self) {
        self.read_user.flush();
        self.read_kernel.flush();
        self.write_user.flush();
        self.write_kernel.flush();
    }

    /// Invalidate the one slot `vaddr` maps to, in all four caches.
    pub fn evict(&mut self, vaddr: u64) {
        self.read_user.evict(vaddr);
        self.read_kernel.evict(vaddr);
        self.write_user.evict(vaddr);
        self.write_kernel.evict(vaddr);
    }

    /// Read guest memory at the current ring. `dst.len()` must be 1/2/4/8.
    pub fn read(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), TranslateFault> {
        self.do_read(vaddr, dst, AccessKind::Read)
    }

    /// Instruction fetch; identical to `read` except the MMU sees a fetch,
    /// which may be permission-checked differently.
    pub fn fetch(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), TranslateFault> {
        self.do_read(vaddr, dst, AccessKind::Fetch)
    }

    /// Write guest memory at the current ring. `src.len()` must be 1/2/4/8.
    pub fn write(&mut self, vaddr: u64, src: &[u8]) -> Result<WriteReceipt, TranslateFault> {
        let size = src.len();
        debug_assert!(matches!(size, 1 | 2 | 4 | 8), "bad access width {size}");

        if self.must_decompose(vaddr, size) {
            let mut receipt: Option<WriteReceipt> = None;
            for (i, byte) in src.iter().enumerate() {
                let r = self.write(vaddr + i as u64, std::slice::from_ref(byte))?;
                match receipt.as_mut() {
                    None => receipt = Some(r),
                    Some(first) => {
                        if page_base(r.paddr) != page_base(first.paddr) {
                            first.straddle_paddr = Some(r.paddr);
                        }
                    }
                }
            }
            // Width >= 1, so at least one byte was written.
            return Ok(receipt.expect("empty write"));
        }

        let info = AccessInfo::new(AccessKind::Write, self.ring);
        let Self {
            mmu,
            devices,
            backing,
            write_user,
            write_kernel,
            ring,
            ..
        } = self;
        let cache = match ring {
            Ring::User => write_user,
            Ring::Kernel => write_kernel,
        };

        let (mut hit, entry) = cache.probe(vaddr);
        if hit && !flags_allow(entry.flags(), AccessKind::Write, *ring) {
            // Stale or incompatible line: refill, letting the MMU decide.
            hit = false;
        }
        if !hit {
            fill_entry(mmu, devices, backing, entry, vaddr, info)?;
            if let Payload::Device(dev) = entry.payload() {
                let paddr = entry.phys_page() | page_offset(vaddr);
                devices.device_write(dev, paddr, size as u32, load_le(src));
                return Ok(WriteReceipt::single(paddr));
            }
        }

        let paddr = entry.phys_page() | page_offset(vaddr);
        match entry.payload() {
            Payload::Ram(host) => host.write(page_offset(vaddr), src),
            // Valid lines are RAM by construction (device lines keep the
            // invalid tag) and the miss path filled this one.
            _ => unreachable!("valid ATC line without RAM payload"),
        }
        Ok(WriteReceipt::single(paddr))
    }

    fn do_read(&mut self, vaddr: u64, dst: &mut [u8], kind: AccessKind) -> Result<(), TranslateFault> {
        let size = dst.len();
        debug_assert!(matches!(size, 1 | 2 | 4 | 8), "bad access width {size}");

        if self.must_decompose(vaddr, size) {
            for i in 0..size {
                self.do_read(vaddr + i as u64, &mut dst[i..i + 1], kind)?;
            }
            return Ok(());
        }

        let info = AccessInfo::new(kind, self.ring);
        let Self {
            mmu,
            devices,
            backing,
            read_user,
            read_kernel,
            ring,
            ..
        } = self;
        let cache = match ring {
            Ring::User => read_user,
            Ring::Kernel => read_kernel,
        };

        let (mut hit, entry) = cache.probe(vaddr);
        if hit && !flags_allow(entry.flags(), kind, *ring) {
            hit = false;
        }
        if !hit {
            fill_entry(mmu, devices, backing, entry, vaddr, info)?;
            if let Payload::Device(dev) = entry.payload() {
                let paddr = entry.phys_page() | page_offset(vaddr);
                let value = devices.device_read(dev, paddr, size as u32);
                store_le(dst, value);
                return Ok(());
            }
        }

        match entry.payload() {
            Payload::Ram(host) => host.read(page_offset(vaddr), dst),
            _ => unreachable!("valid ATC line without RAM payload"),
        }
        Ok(())
    }

    /// Uncached, side-effect-free read: the debugger/oracle path. Goes
    /// through the MMU and backing directly and never touches a cache line.
    /// Device pages are not peekable.
    pub fn peek(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), TranslateFault> {
        for i in 0..dst.len() {
            let addr = vaddr + i as u64;
            let info = AccessInfo::sideless(AccessKind::Read, self.ring);
            let tx = self.mmu.translate(addr, info)?;
            let phys_page = page_base(tx.paddr);
            if self.devices.has_device(tx.paddr) {
                return Err(TranslateFault::Unbacked { paddr: tx.paddr });
            }
            let host = self
                .backing
                .lock_page(phys_page)
                .ok_or(TranslateFault::Unbacked { paddr: phys_page })?;
            host.read(page_offset(addr), &mut dst[i..i + 1]);
        }
        Ok(())
    }

    /// Uncached, side-effect-free write counterpart of [`Self::peek`].
    pub fn poke(&mut self, vaddr: u64, src: &[u8]) -> Result<(), TranslateFault> {
        for (i, byte) in src.iter().enumerate() {
            let addr = vaddr + i as u64;
            let info = AccessInfo::sideless(AccessKind::Write, self.ring);
            let tx = self.mmu.translate(addr, info)?;
            let phys_page = page_base(tx.paddr);
            if self.devices.has_device(tx.paddr) {
                return Err(TranslateFault::Unbacked { paddr: tx.paddr });
            }
            let host = self
                .backing
                .lock_page(phys_page)
                .ok_or(TranslateFault::Unbacked { paddr: phys_page })?;
            host.write(page_offset(addr), std::slice::from_ref(byte));
        }
        Ok(())
    }

    /// Cache-accelerated translation without guest-visible side effects: a
    /// valid matching line answers directly, anything else falls back to a
    /// side-effect-free MMU walk (which does not install a line).
    pub fn translate_probe(&mut self, vaddr: u64, info: AccessInfo) -> Result<u64, TranslateFault> {
        let cache = match (info.kind.is_write(), info.ring) {
            (false, Ring::User) => &mut self.read_user,
            (false, Ring::Kernel) => &mut self.read_kernel,
            (true, Ring::User) => &mut self.write_user,
            (true, Ring::Kernel) => &mut self.write_kernel,
        };
        let (hit, entry) = cache.probe(vaddr);
        if hit {
            return Ok(entry.phys_page() | page_offset(vaddr));
        }
        let info = AccessInfo {
            side_effects: false,
            ..info
        };
        self.mmu.translate(vaddr, info).map(|tx| tx.paddr)
    }

    #[inline]
    fn must_decompose(&self, vaddr: u64, size: usize) -> bool {
        if size == 1 {
            return false;
        }
        if page_offset(vaddr) + size as u64 > PAGE_SIZE {
            return true;
        }
        self.config.check_alignment && vaddr & (size as u64 - 1) != 0
    }
}

/// Can a request of `kind` at `ring` be served by a line with `flags`?
///
/// Lines are filled by a translation performed at the same ring, so in the
/// common case this is true; it protects against a line surviving a guest
/// permission downgrade that the broker has not yet delivered.
#[inline]
fn flags_allow(flags: AtcFlags, kind: AccessKind, ring: Ring) -> bool {
    match ring {
        Ring::Kernel => true,
        Ring::User => match kind {
            AccessKind::Read | AccessKind::Fetch => !flags.contains(AtcFlags::PRIV_READ),
            AccessKind::Write => flags.contains(AtcFlags::USER_WRITE),
        },
    }
}

#[inline]
fn perm_flags(perms: PagePerms) -> AtcFlags {
    let mut flags = AtcFlags::empty();
    if !perms.contains(PagePerms::USER_READ) {
        flags |= AtcFlags::PRIV_READ;
    }
    if !perms.contains(PagePerms::USER_WRITE) {
        flags |= AtcFlags::PRIV_WRITE;
    } else {
        flags |= AtcFlags::USER_WRITE;
    }
    flags
}

/// Full translation + device check + host-page lock for a missed access.
///
/// On any fault the probed line is left invalid; nothing else is disturbed.
fn fill_entry<M, D, P>(
    mmu: &mut M,
    devices: &mut D,
    backing: &mut P,
    entry: &mut AtcEntry,
    vaddr: u64,
    info: AccessInfo,
) -> Result<(), TranslateFault>
where
    M: AddressTranslator,
    D: DeviceBus,
    P: MemoryBacking,
{
    let tx = match mmu.translate(vaddr, info) {
        Ok(tx) => tx,
        Err(fault) => {
            entry.invalidate();
            return Err(fault);
        }
    };

    let phys_page = page_base(tx.paddr);
    if let Some(dev) = devices.lookup_device(tx.paddr) {
        log::trace!("ATC fill {vaddr:#x}: device {dev:?} at {phys_page:#x}");
        entry.fill_device(phys_page, dev);
        return Ok(());
    }

    let host = match backing.lock_page(phys_page) {
        Some(host) => host,
        None => {
            entry.invalidate();
            return Err(TranslateFault::Unbacked { paddr: phys_page });
        }
    };
    log::trace!("ATC fill {vaddr:#x}: ram page {phys_page:#x}");
    entry.fill_ram(vaddr, phys_page, host, perm_flags(tx.perms));
    Ok(())
}

#[inline]
fn load_le(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..src.len()].copy_from_slice(src);
    u64::from_le_bytes(buf)
}

#[inline]
fn store_le(dst: &mut [u8], value: u64) {
    let bytes = value.to_le_bytes();
    dst.copy_from_slice(&bytes[..dst.len()]);
}
