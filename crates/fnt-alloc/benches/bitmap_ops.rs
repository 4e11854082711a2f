//! Benchmark: byte-skipping bitmap search and allocator strategies.
//!
//! Compares `bitmap_find_clear` (skips fully-set bytes) against a plain
//! bit-by-bit scan, and measures the allocator on an empty versus a
//! fragmented volume.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fnt_alloc::{AllocRequest, BitVector, FreeSpaceAllocator, bitmap_find_clear, bitmap_get};
use fnt_block::ResidentBytes;
use fnt_types::ClusterRun;

const BITS: u64 = 32768;

/// 4096-byte bitmap (32768 clusters), ~5% free in small holes.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    let mut pos = 100_usize;
    while pos + 32 < 32768 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn plain_find_clear(bm: &[u8], start: u64, end: u64) -> Option<u64> {
    (start..end).find(|&idx| !bitmap_get(bm, idx))
}

fn bench_find_clear(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("find_clear");

    group.bench_function("bit_by_bit", |b| {
        b.iter(|| black_box(plain_find_clear(black_box(&bm), black_box(16000), BITS)));
    });

    group.bench_function("byte_skipping", |b| {
        b.iter(|| black_box(bitmap_find_clear(black_box(&bm), black_box(16000), BITS)));
    });

    group.finish();
}

fn make_allocator(fragmented: bool) -> FreeSpaceAllocator {
    let bv = BitVector::create(Box::new(ResidentBytes::new()), BITS).expect("bitmap");
    let mut alloc = FreeSpaceAllocator::new(bv, BITS).expect("alloc");
    if fragmented {
        for lcn in (0..BITS).step_by(3) {
            alloc
                .mark_allocated(ClusterRun::new(lcn, 1))
                .expect("mark");
        }
    }
    alloc
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_256");

    group.bench_function("empty_volume", |b| {
        b.iter_batched(
            || make_allocator(false),
            |mut alloc| black_box(alloc.allocate(&AllocRequest::new(256)).expect("alloc")),
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("fragmented_volume", |b| {
        b.iter_batched(
            || make_allocator(true),
            |mut alloc| black_box(alloc.allocate(&AllocRequest::new(256)).expect("alloc")),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_find_clear, bench_allocate);
criterion_main!(benches);
