//! Benchmarks for dense float distance kernels.
//!
//! These kernels dominate k-means assignment, residual beam search and exact KNN.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quantscan::distance::knn_extra_metrics;
use quantscan::filtering::BitsetView;
use quantscan::{simd, MetricType};
use rand::prelude::*;

// === Generators ===

fn random_flat(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
}

// === Benchmarks ===

fn bench_l2_dimensions(c: &mut Criterion) {
    let mut group = c.benchmark_group("l2_sqr");

    for dim in [16, 64, 128, 384, 768, 1536].iter() {
        group.throughput(Throughput::Elements(*dim as u64));

        let v = random_flat(2, *dim, 42);
        let (a, b) = v.split_at(*dim);

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |bench, _| {
            bench.iter(|| simd::l2_sqr(black_box(a), black_box(b)));
        });
    }

    group.finish();
}

fn bench_dot_dimensions(c: &mut Criterion) {
    let mut group = c.benchmark_group("dot");

    for dim in [16, 64, 128, 384, 768, 1536].iter() {
        group.throughput(Throughput::Elements(*dim as u64));

        let v = random_flat(2, *dim, 42);
        let (a, b) = v.split_at(*dim);

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |bench, _| {
            bench.iter(|| simd::dot(black_box(a), black_box(b)));
        });
    }

    group.finish();
}

fn bench_l2_ny(c: &mut Criterion) {
    let mut group = c.benchmark_group("l2_sqr_ny");

    let dim = 128;
    for ny in [16, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*ny as u64));

        let x = random_flat(1, dim, 1);
        let y = random_flat(*ny, dim, 2);
        let mut dis = vec![0.0f32; *ny];

        group.bench_with_input(BenchmarkId::from_parameter(ny), ny, |bench, &ny| {
            bench.iter(|| simd::l2_sqr_ny(black_box(&mut dis), black_box(&x), &y, dim, ny));
        });
    }

    group.finish();
}

fn bench_extra_metrics_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_extra_metrics");
    group.sample_size(20);

    let (dim, nq, nb, k) = (64, 16, 10_000, 10);
    let xq = random_flat(nq, dim, 3);
    let xb = random_flat(nb, dim, 4);
    group.throughput(Throughput::Elements((nq * nb) as u64));

    for metric in [MetricType::L2, MetricType::L1, MetricType::Canberra] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{metric:?}")),
            &metric,
            |bench, &metric| {
                bench.iter(|| {
                    knn_extra_metrics(&xq, &xb, dim, metric, 0.0, k, BitsetView::empty()).unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_l2_dimensions,
    bench_dot_dimensions,
    bench_l2_ny,
    bench_extra_metrics_knn,
);
criterion_main!(benches);
