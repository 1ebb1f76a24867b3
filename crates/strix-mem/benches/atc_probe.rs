#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use strix_mem::{Atc, AtcFlags, HostPage, PAGE_SIZE};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("STRIX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_probe(c: &mut Criterion) {
    let mut backing = vec![0u8; PAGE_SIZE as usize];
    let host = unsafe { HostPage::new(std::ptr::NonNull::new(backing.as_mut_ptr()).unwrap()) };

    let mut group = c.benchmark_group("atc_probe");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit", |b| {
        let mut atc = Atc::new();
        atc.probe(0x1000).1.fill_ram(0x1000, 0x1000, host, AtcFlags::USER_WRITE);
        b.iter(|| {
            let (hit, entry) = atc.probe(black_box(0x1abc));
            black_box((hit, entry.phys_page()));
        });
    });

    group.bench_function("miss", |b| {
        let mut atc = Atc::new();
        b.iter(|| {
            let (hit, entry) = atc.probe(black_box(0x7f000));
            black_box((hit, entry.is_valid()));
        });
    });

    group.bench_function("fill_and_flush_64_lines", |b| {
        let mut atc = Atc::new();
        b.iter(|| {
            for vpage in 0..64u64 {
                let vaddr = vpage << 12;
                atc.probe(vaddr).1.fill_ram(vaddr, vaddr, host, AtcFlags::USER_WRITE);
            }
            atc.flush();
        });
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_probe
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
