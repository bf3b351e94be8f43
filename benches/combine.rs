use criterion::{criterion_group, criterion_main, Criterion};
use resumable_transfer::checksum::{combine_parts, crc64};
use resumable_transfer::part::{plan_parts, MIN_PART_SIZE};
use resumable_transfer::test::random_bytes;
use std::hint::black_box;

const PART_COUNT: u64 = 10000;

fn criterion_benchmark(c: &mut Criterion) {
    let data = random_bytes(1024 * 1024, 42);
    c.bench_function("crc64 1 MiB", |b| b.iter(|| crc64(black_box(&data))));

    let parts = plan_parts(PART_COUNT * MIN_PART_SIZE, MIN_PART_SIZE)
        .unwrap()
        .into_iter()
        .map(|part| (part.part_number(), part.size()))
        .collect::<Vec<_>>();
    c.bench_function("combine 10000 parts", |b| {
        b.iter(|| combine_parts(black_box(parts.iter().copied())))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
