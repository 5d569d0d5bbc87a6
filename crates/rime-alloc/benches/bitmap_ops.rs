//! Benchmark: bitmap scan primitives under realistic occupancy.
//!
//! Measures the linear helpers the allocator leans on: free-bit counting,
//! first-free search, and contiguous-run search, over a bitmap with ~5%
//! free blocks scattered in clusters.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rime_alloc::{bitmap_count_free, bitmap_find_free, bitmap_find_run};

/// 4096 bytes (32768 bits), a free cluster every ~650 blocks.
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

fn bench_count_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), 32768)));
    });
}

fn bench_find_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_find_free", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), 32768, black_box(16000))));
    });
}

fn bench_find_run(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_find_run_32", |b| {
        b.iter(|| {
            black_box(bitmap_find_run(
                black_box(&bm),
                32768,
                black_box(16000),
                32,
            ))
        });
    });
}

criterion_group!(benches, bench_count_free, bench_find_free, bench_find_run);
criterion_main!(benches);
