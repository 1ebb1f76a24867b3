use crate::test_util::{TestDevices, TestMmu, TestRam};
use crate::{
    AccessInfo, AccessKind, CachedMemory, DeviceId, MemConfig, PagePerms, Ring, TranslateFault,
};

type Mem = CachedMemory<TestMmu, TestDevices, TestRam>;

fn mem() -> Mem {
    CachedMemory::new(
        TestMmu::new(),
        TestDevices::new(),
        TestRam::new(),
        MemConfig::default(),
    )
}

#[test]
fn read_miss_fills_then_hits_without_rewalking() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    mem.backing_mut().write_u32(0x8004, 0xdead_beef);

    let mut buf = [0u8; 4];
    mem.read(0x1004, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xdead_beef);
    let walks_after_miss = mem.mmu().walks;

    mem.read(0x1004, &mut buf).unwrap();
    mem.read(0x1ff8, &mut buf).unwrap();
    assert_eq!(
        mem.mmu().walks,
        walks_after_miss,
        "hits must not reach the MMU"
    );
}

#[test]
fn write_goes_through_cache_and_reports_paddr() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x2000, 0x9000, TestMmu::rw_all());

    let receipt = mem.write(0x2010, &0x1122_3344u32.to_le_bytes()).unwrap();
    assert_eq!(receipt.paddr, 0x9010);
    assert_eq!(receipt.straddle_paddr, None);
    assert_eq!(mem.backing_mut().read_u32(0x9010), 0x1122_3344);
}

#[test]
fn translation_fault_leaves_no_cached_line() {
    let mut mem = mem();
    let mut buf = [0u8; 4];
    assert_eq!(
        mem.read(0x5000, &mut buf),
        Err(TranslateFault::NotMapped { vaddr: 0x5000 })
    );
    assert_eq!(mem.cache(false, Ring::Kernel).valid_lines(), 0);
}

#[test]
fn unprivileged_read_of_kernel_page_faults_and_fills_nothing() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::kernel_only());
    mem.set_ring(Ring::User);

    let mut buf = [0u8; 4];
    let fault = mem.read(0x1000, &mut buf).unwrap_err();
    assert!(matches!(fault, TranslateFault::Denied { ring: Ring::User, .. }));
    assert_eq!(
        mem.cache(false, Ring::User).valid_lines(),
        0,
        "the user-read ATC must never receive a line for a privileged page"
    );

    // The same page is perfectly cacheable for the kernel.
    mem.set_ring(Ring::Kernel);
    mem.read(0x1000, &mut buf).unwrap();
    assert_eq!(mem.cache(false, Ring::Kernel).valid_lines(), 1);
    assert_eq!(mem.cache(false, Ring::User).valid_lines(), 0);
}

#[test]
fn permission_downgrade_plus_evict_faults_the_next_write() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x3000, 0xa000, TestMmu::rw_all());
    mem.set_ring(Ring::User);
    mem.write(0x3000, &[1]).unwrap();

    mem.mmu_mut().map_page(0x3000, 0xa000, TestMmu::kernel_only());
    mem.evict(0x3000);
    assert!(mem.write(0x3000, &[2]).is_err());
}

#[test]
fn page_straddling_access_is_decomposed_into_bytes() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    mem.mmu_mut().map_page(0x2000, 0x6000, TestMmu::rw_all());

    let receipt = mem.write(0x1ffe, &0xaabb_ccddu32.to_le_bytes()).unwrap();
    assert_eq!(receipt.paddr, 0x8ffe);
    assert_eq!(receipt.straddle_paddr, Some(0x6001));

    // Bytes land on the right sides of the boundary.
    assert_eq!(mem.backing_mut().page_mut(0x8000)[0xffe], 0xdd);
    assert_eq!(mem.backing_mut().page_mut(0x8000)[0xfff], 0xcc);
    assert_eq!(mem.backing_mut().page_mut(0x6000)[0], 0xbb);
    assert_eq!(mem.backing_mut().page_mut(0x6000)[1], 0xaa);

    let mut buf = [0u8; 4];
    mem.read(0x1ffe, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xaabb_ccdd);
}

#[test]
fn straddling_fault_stops_at_the_boundary() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    // 0x2000 unmapped: the write faults after the first two bytes.
    let fault = mem.write(0x1ffe, &0xaabb_ccddu32.to_le_bytes()).unwrap_err();
    assert_eq!(fault, TranslateFault::NotMapped { vaddr: 0x2000 });
    assert_eq!(mem.backing_mut().page_mut(0x8000)[0xffe], 0xdd);
    assert_eq!(mem.backing_mut().page_mut(0x8000)[0xfff], 0xcc);
}

#[test]
fn unaligned_in_page_access_respects_alignment_policy() {
    let mut strict = mem();
    strict.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    strict.write(0x1002, &0x0102_0304u32.to_le_bytes()).unwrap();
    let mut buf = [0u8; 4];
    strict.read(0x1002, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0x0102_0304);

    let mut relaxed = CachedMemory::new(
        TestMmu::new(),
        TestDevices::new(),
        TestRam::new(),
        MemConfig {
            check_alignment: false,
        },
    );
    relaxed.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    relaxed.write(0x1002, &0x0102_0304u32.to_le_bytes()).unwrap();
    relaxed.read(0x1002, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0x0102_0304);
}

#[test]
fn device_accesses_dispatch_and_are_never_cached() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x4000, 0xf000, TestMmu::rw_all());
    mem.devices_mut().add_device(0xf000, DeviceId(7), 0x55);

    let mut buf = [0u8; 4];
    mem.read(0x4008, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0x55);

    mem.write(0x400c, &0x77u32.to_le_bytes()).unwrap();
    assert_eq!(mem.devices_mut().writes, vec![(DeviceId(7), 0xf00c, 4, 0x77)]);

    // Every device access re-translates: no line was installed.
    assert_eq!(mem.cache(false, Ring::Kernel).valid_lines(), 0);
    assert_eq!(mem.cache(true, Ring::Kernel).valid_lines(), 0);
    let walks = mem.mmu().walks;
    mem.read(0x4008, &mut buf).unwrap();
    assert!(mem.mmu().walks > walks);
}

#[test]
fn evict_then_remap_serves_the_new_mapping() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x6000, 0x8000, TestMmu::rw_all());
    mem.backing_mut().write_u32(0x8000, 1);
    mem.backing_mut().write_u32(0xb000, 2);

    let mut buf = [0u8; 4];
    mem.read(0x6000, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 1);

    // Guest remaps the page and evicts its TLB entry.
    mem.mmu_mut().map_page(0x6000, 0xb000, TestMmu::rw_all());
    mem.evict(0x6000);
    mem.read(0x6000, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 2);
}

#[test]
fn flush_caches_drops_every_ring_and_direction() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());
    let mut buf = [0u8; 1];
    mem.read(0x1000, &mut buf).unwrap();
    mem.write(0x1000, &[0]).unwrap();
    mem.set_ring(Ring::User);
    mem.read(0x1000, &mut buf).unwrap();
    mem.write(0x1000, &[0]).unwrap();

    mem.flush_caches();
    for &(w, ring) in &[
        (false, Ring::User),
        (false, Ring::Kernel),
        (true, Ring::User),
        (true, Ring::Kernel),
    ] {
        assert_eq!(mem.cache(w, ring).valid_lines(), 0);
    }
}

#[test]
fn translate_probe_uses_cache_then_falls_back_sideless() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());

    let info = AccessInfo::new(AccessKind::Read, Ring::Kernel);
    assert_eq!(mem.translate_probe(0x1234, info).unwrap(), 0x8234);

    // Warm the cache via a real read; the probe now answers without a walk.
    let mut buf = [0u8; 1];
    mem.read(0x1000, &mut buf).unwrap();
    let walks = mem.mmu().walks;
    assert_eq!(mem.translate_probe(0x1abc, info).unwrap(), 0x8abc);
    assert_eq!(mem.mmu().walks, walks);
}

#[test]
fn peek_and_poke_bypass_the_caches() {
    let mut mem = mem();
    mem.mmu_mut().map_page(0x1000, 0x8000, TestMmu::rw_all());

    mem.poke(0x1004, &0xfeedu32.to_le_bytes()).unwrap();
    let mut buf = [0u8; 4];
    mem.peek(0x1004, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xfeed);
    assert_eq!(mem.cache(false, Ring::Kernel).valid_lines(), 0);
    assert_eq!(mem.cache(true, Ring::Kernel).valid_lines(), 0);
}
