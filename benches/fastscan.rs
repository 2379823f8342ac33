//! Benchmarks for the 4-bit fast-scan kernel and its result handlers.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quantscan::fastscan::{
    accumulate_qbs_with, pack_codes, pack_lut, padded_ntotal, preferred_qbs, HeapHandler, Kernel,
    ReservoirHandler,
};
use quantscan::heap::CMax;
use rand::prelude::*;

// === Generators ===

struct Setup {
    n: usize,
    nq: usize,
    nsq: usize,
    qbs: usize,
    codes: quantscan::fastscan::AlignedBytes,
    lut: quantscan::fastscan::AlignedBytes,
}

fn setup(n: usize, nq: usize, nsq: usize) -> Setup {
    let mut rng = StdRng::seed_from_u64(42);
    let raw: Vec<u8> = (0..n * nsq).map(|_| rng.random_range(0..16u8)).collect();
    let lut: Vec<u8> = (0..nq * nsq * 16).map(|_| rng.random_range(0..32u8)).collect();
    let qbs = preferred_qbs(nq).unwrap();
    Setup {
        n,
        nq,
        nsq,
        qbs,
        codes: pack_codes(&raw, n, nsq).unwrap(),
        lut: pack_lut(qbs, nsq, &lut).unwrap(),
    }
}

// === Benchmarks ===

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("fastscan_heap_k10");
    group.sample_size(30);

    let s = setup(65_536, 4, 16);
    group.throughput(Throughput::Elements((s.n * s.nq) as u64));

    for kernel in [Kernel::Portable, Kernel::Avx2] {
        if !kernel.is_available() {
            continue;
        }
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{kernel:?}")),
            &kernel,
            |bench, &kernel| {
                bench.iter(|| {
                    let mut h = HeapHandler::<CMax<u16>>::new(s.nq, s.n, 10);
                    accumulate_qbs_with(
                        kernel,
                        s.qbs,
                        padded_ntotal(s.n),
                        s.nsq,
                        &s.codes,
                        &s.lut,
                        &mut h,
                    )
                    .unwrap();
                    black_box(h)
                });
            },
        );
    }

    group.finish();
}

fn bench_query_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("fastscan_query_batch");
    group.sample_size(20);

    for nq in [1usize, 4, 8, 12, 24].iter() {
        let s = setup(32_768, *nq, 16);
        group.throughput(Throughput::Elements((s.n * s.nq) as u64));

        group.bench_with_input(BenchmarkId::from_parameter(nq), nq, |bench, _| {
            bench.iter(|| {
                let mut h = ReservoirHandler::<CMax<u16>>::with_k(s.nq, s.n, 10);
                accumulate_qbs_with(
                    Kernel::detect(),
                    s.qbs,
                    padded_ntotal(s.n),
                    s.nsq,
                    &s.codes,
                    &s.lut,
                    &mut h,
                )
                .unwrap();
                black_box(h)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_kernels, bench_query_batches);
criterion_main!(benches);
