use criterion::{criterion_group, criterion_main, Criterion};
use gameboy_core::gb::GameBoy;

fn empty_rom() -> Vec<u8> {
    let mut data = vec![0x00; 0x8000];
    data[0x0104..0x0134].copy_from_slice(&[
        0xce, 0xed, 0x66, 0x66, 0xcc, 0x0d, 0x00, 0x0b, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0c, 0x00,
        0x0d, 0x00, 0x08, 0x11, 0x1f, 0x88, 0x89, 0x00, 0x0e, 0xdc, 0xcc, 0x6e, 0xe6, 0xdd, 0xdd,
        0xd9, 0x99, 0xbb, 0xbb, 0x67, 0x63, 0x6e, 0x0e, 0xec, 0xcc, 0xdd, 0xdc, 0x99, 0x9f, 0xbb,
        0xb9, 0x33, 0x3e,
    ]);
    data[0x0134..0x0143].copy_from_slice(b"BENCH\0\0\0\0\0\0\0\0");
    let checksum = data[0x0134..0x014d]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));
    data[0x014d] = checksum;
    data
}

fn benchmark_cpu_clock(c: &mut Criterion) {
    let rom = empty_rom();
    let mut gb = GameBoy::new(None);
    gb.load_cartridge(&rom).unwrap();
    gb.boot();

    c.bench_function("cpu_clock_1m_cycles", |b| {
        b.iter(|| {
            let mut cycles = 0u32;
            while cycles < 1_000_000 {
                cycles += gb.clock() as u32;
            }
        })
    });
}

criterion_group!(benches, benchmark_cpu_clock);
criterion_main!(benches);
