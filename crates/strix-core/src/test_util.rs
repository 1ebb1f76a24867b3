use crate::{BlockCompiler, CompiledBlock, CoreError};
use std::collections::HashMap;
use std::ptr::NonNull;
use strix_events::Ring;
use strix_jit_cache::FeatureSet;
use strix_mem::{
    page_base, AccessInfo, AccessKind, AddressTranslator, CachedMemory, DeviceBus, DeviceId,
    HostPage, MemoryBacking, PagePerms, TranslateFault, Translation, PAGE_SIZE,
};

/// Sparse guest RAM with stable page addresses.
#[derive(Default)]
pub struct TestRam {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl TestRam {
    pub fn new() -> Self {
        Self::default()
    }

    fn page_mut(&mut self, paddr: u64) -> &mut [u8; PAGE_SIZE as usize] {
        self.pages
            .entry(page_base(paddr))
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]))
    }
}

impl MemoryBacking for TestRam {
    fn lock_page(&mut self, phys_page_base: u64) -> Option<HostPage> {
        let page = self.page_mut(phys_page_base);
        Some(unsafe { HostPage::new(NonNull::new(page.as_mut_ptr()).unwrap()) })
    }
}

/// Table-driven MMU stand-in: virtual page base → (physical page, perms).
#[derive(Default)]
pub struct TestMmu {
    map: HashMap<u64, (u64, PagePerms)>,
    pub walks: usize,
}

impl TestMmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_page(&mut self, vaddr: u64, phys: u64, perms: PagePerms) {
        self.map.insert(page_base(vaddr), (page_base(phys), perms));
    }

    pub fn unmap_page(&mut self, vaddr: u64) {
        self.map.remove(&page_base(vaddr));
    }
}

impl AddressTranslator for TestMmu {
    fn translate(&mut self, vaddr: u64, info: AccessInfo) -> Result<Translation, TranslateFault> {
        self.walks += 1;
        let (phys, perms) = self
            .map
            .get(&page_base(vaddr))
            .copied()
            .ok_or(TranslateFault::NotMapped { vaddr })?;
        let needed = match (info.ring, info.kind) {
            (Ring::User, AccessKind::Read | AccessKind::Fetch) => PagePerms::USER_READ,
            (Ring::User, AccessKind::Write) => PagePerms::USER_WRITE,
            (Ring::Kernel, AccessKind::Read | AccessKind::Fetch) => PagePerms::KERNEL_READ,
            (Ring::Kernel, AccessKind::Write) => PagePerms::KERNEL_WRITE,
        };
        if !perms.contains(needed) {
            return Err(TranslateFault::Denied {
                vaddr,
                ring: info.ring,
                kind: info.kind,
            });
        }
        Ok(Translation {
            paddr: phys | (vaddr & (PAGE_SIZE - 1)),
            perms,
        })
    }
}

/// No devices mapped anywhere.
#[derive(Default)]
pub struct NoDevices;

impl DeviceBus for NoDevices {
    fn lookup_device(&self, _paddr: u64) -> Option<DeviceId> {
        None
    }

    fn device_read(&mut self, _dev: DeviceId, _paddr: u64, _size: u32) -> u64 {
        0
    }

    fn device_write(&mut self, _dev: DeviceId, _paddr: u64, _size: u32, _value: u64) {}
}

/// Compiler stand-in: the "translation" of a block is the 4 instruction
/// bytes at its PC, so tests can tell which memory contents a cached block
/// was built from. Counts compilations to assert on cache hits.
#[derive(Default)]
pub struct TestCompiler {
    pub compiles: usize,
    /// When set, every produced block requires these feature levels.
    pub specialize_to: Option<FeatureSet>,
}

impl TestCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M, D, P> BlockCompiler<M, D, P> for TestCompiler
where
    M: AddressTranslator,
    D: DeviceBus,
    P: MemoryBacking,
{
    fn compile(
        &mut self,
        pc: u64,
        _features: &FeatureSet,
        mem: &mut CachedMemory<M, D, P>,
    ) -> Result<CompiledBlock, CoreError> {
        self.compiles += 1;
        let mut bytes = [0u8; 4];
        mem.fetch(pc, &mut bytes)?;
        Ok(CompiledBlock {
            code: Box::new(bytes),
            guest_len: 4,
            required: self.specialize_to.clone(),
        })
    }
}
