use crate::{
    page_base, AccessInfo, AccessKind, AddressTranslator, DeviceBus, DeviceId, HostPage,
    MemoryBacking, PagePerms, Ring, TranslateFault, Translation, PAGE_SIZE,
};
use std::collections::HashMap;
use std::ptr::NonNull;

/// Sparse guest RAM. Pages are boxed so their host addresses stay stable
/// while the map grows, which is what `lock_page` promises.
#[derive(Default)]
pub struct TestRam {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl TestRam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_mut(&mut self, paddr: u64) -> &mut [u8; PAGE_SIZE as usize] {
        self.pages
            .entry(page_base(paddr))
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]))
    }

    pub fn read_u32(&mut self, paddr: u64) -> u32 {
        let off = (paddr % PAGE_SIZE) as usize;
        let page = self.page_mut(paddr);
        u32::from_le_bytes(page[off..off + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, paddr: u64, value: u32) {
        let off = (paddr % PAGE_SIZE) as usize;
        self.page_mut(paddr)[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl MemoryBacking for TestRam {
    fn lock_page(&mut self, phys_page_base: u64) -> Option<HostPage> {
        let page = self.page_mut(phys_page_base);
        Some(unsafe { HostPage::new(NonNull::new(page.as_mut_ptr()).unwrap()) })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub phys: u64,
    pub perms: PagePerms,
}

/// Table-driven MMU stand-in: virtual page base → (physical page, perms).
/// Counts walks so tests can assert cache hits avoided them.
#[derive(Default)]
pub struct TestMmu {
    map: HashMap<u64, Mapping>,
    pub walks: usize,
}

impl TestMmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_page(&mut self, vaddr: u64, phys: u64, perms: PagePerms) {
        self.map.insert(
            page_base(vaddr),
            Mapping {
                phys: page_base(phys),
                perms,
            },
        );
    }

    pub fn unmap_page(&mut self, vaddr: u64) {
        self.map.remove(&page_base(vaddr));
    }

    pub fn rw_all() -> PagePerms {
        PagePerms::all()
    }

    pub fn kernel_only() -> PagePerms {
        PagePerms::KERNEL_READ | PagePerms::KERNEL_WRITE
    }
}

impl AddressTranslator for TestMmu {
    fn translate(&mut self, vaddr: u64, info: AccessInfo) -> Result<Translation, TranslateFault> {
        self.walks += 1;
        let mapping = self
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
        if !mapping.perms.contains(needed) {
            return Err(TranslateFault::Denied {
                vaddr,
                ring: info.ring,
                kind: info.kind,
            });
        }
        Ok(Translation {
            paddr: mapping.phys | (vaddr & (PAGE_SIZE - 1)),
            perms: mapping.perms,
        })
    }
}

/// Device manager stand-in: physical page base → device id, with a register
/// file recording the last write and serving a fixed read value per device.
#[derive(Default)]
pub struct TestDevices {
    devices: HashMap<u64, DeviceId>,
    pub read_values: HashMap<DeviceId, u64>,
    pub writes: Vec<(DeviceId, u64, u32, u64)>,
    pub reads: usize,
}

impl TestDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, phys_page: u64, dev: DeviceId, read_value: u64) {
        self.devices.insert(page_base(phys_page), dev);
        self.read_values.insert(dev, read_value);
    }
}

impl DeviceBus for TestDevices {
    fn lookup_device(&self, paddr: u64) -> Option<DeviceId> {
        self.devices.get(&page_base(paddr)).copied()
    }

    fn device_read(&mut self, dev: DeviceId, _paddr: u64, _size: u32) -> u64 {
        self.reads += 1;
        self.read_values.get(&dev).copied().unwrap_or(0)
    }

    fn device_write(&mut self, dev: DeviceId, paddr: u64, size: u32, value: u64) {
        self.writes.push((dev, paddr, size, value));
    }
}
