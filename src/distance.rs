//! Distance metrics for dense float vectors.
//!
//! L2 and inner product are served by the vectorized kernels in [`crate::simd`]; this
//! module adds the remaining metrics as a single functor, [`VectorDistance`], plus the two
//! brute-force drivers built on it:
//!
//! - [`pairwise_distances`]: the full `nq × nb` matrix.
//! - [`knn_extra_metrics`]: top-k per query with an optional exclusion bitset.
//!
//! ## Conventions
//!
//! - `L2` is the *squared* Euclidean distance.
//! - `Lp` returns `Σ |x - y|^p` without the final root (monotone in the true distance).
//! - `Jaccard` on floats is the weighted form `1 - Σ min / Σ max`.
//! - Terms with a zero denominator (Canberra, Jensen-Shannon) contribute 0.

use rayon::prelude::*;

use crate::error::{QuantError, Result};
use crate::filtering::BitsetView;
use crate::heap::{heap_heapify, heap_offer, heap_reorder, CMax, CMin, Comparator};
use crate::metric::MetricType;
use crate::simd;

/// Distance functor for one metric and dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorDistance {
    /// Metric.
    pub metric: MetricType,
    /// Vector dimension.
    pub d: usize,
    /// Metric argument (`p` for `Lp`, ignored otherwise).
    pub metric_arg: f32,
}

impl VectorDistance {
    /// Build a functor, rejecting metrics that do not apply to float vectors.
    pub fn new(metric: MetricType, d: usize, metric_arg: f32) -> Result<Self> {
        if metric.is_binary() && metric != MetricType::Jaccard {
            return Err(QuantError::UnsupportedMetric {
                metric,
                code_size: d,
            });
        }
        if metric == MetricType::Lp && !(metric_arg > 0.0) {
            return Err(QuantError::Configuration(format!(
                "Lp metric needs p > 0, got {metric_arg}"
            )));
        }
        Ok(Self {
            metric,
            d,
            metric_arg,
        })
    }

    /// Distance (or similarity, for inner product) between `x` and `y`.
    #[inline]
    #[must_use]
    pub fn eval(&self, x: &[f32], y: &[f32]) -> f32 {
        debug_assert_eq!(x.len(), self.d);
        debug_assert_eq!(y.len(), self.d);
        match self.metric {
            MetricType::L2 => simd::l2_sqr(x, y),
            MetricType::InnerProduct => simd::dot(x, y),
            MetricType::L1 => simd::l1(x, y),
            MetricType::Linf => simd::linf(x, y),
            MetricType::Lp => lp(x, y, self.metric_arg),
            MetricType::Canberra => canberra(x, y),
            MetricType::BrayCurtis => bray_curtis(x, y),
            MetricType::JensenShannon => jensen_shannon(x, y),
            MetricType::Jaccard => weighted_jaccard(x, y),
            // rejected by `new`
            _ => f32::NAN,
        }
    }
}

fn lp(x: &[f32], y: &[f32], p: f32) -> f32 {
    x.iter().zip(y).map(|(a, b)| (a - b).abs().powf(p)).sum()
}

fn canberra(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y)
        .map(|(a, b)| {
            let den = a.abs() + b.abs();
            if den == 0.0 {
                0.0
            } else {
                (a - b).abs() / den
            }
        })
        .sum()
}

fn bray_curtis(x: &[f32], y: &[f32]) -> f32 {
    let (num, den) = x.iter().zip(y).fold((0.0f32, 0.0f32), |(n, d), (a, b)| {
        (n + (a - b).abs(), d + (a + b).abs())
    });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn jensen_shannon(x: &[f32], y: &[f32]) -> f32 {
    let kl = |p: f32, m: f32| if p > 0.0 && m > 0.0 { -p * (m / p).ln() } else { 0.0 };
    let acc: f32 = x
        .iter()
        .zip(y)
        .map(|(&a, &b)| {
            let m = 0.5 * (a + b);
            kl(a, m) + kl(b, m)
        })
        .sum();
    0.5 * acc
}

fn weighted_jaccard(x: &[f32], y: &[f32]) -> f32 {
    let (num, den) = x
        .iter()
        .zip(y)
        .fold((0.0f32, 0.0f32), |(n, d), (a, b)| (n + a.min(*b), d + a.max(*b)));
    if den == 0.0 {
        0.0
    } else {
        1.0 - num / den
    }
}

/// Fill `dis` (`nq × nb`, row-major) with distances between every query and every base vector.
pub fn pairwise_distances(
    d: usize,
    xq: &[f32],
    xb: &[f32],
    metric: MetricType,
    metric_arg: f32,
    dis: &mut [f32],
) -> Result<()> {
    let vd = VectorDistance::new(metric, d, metric_arg)?;
    if d == 0 || xq.len() % d != 0 || xb.len() % d != 0 {
        return Err(QuantError::Configuration(format!(
            "input lengths {} / {} are not multiples of d = {d}",
            xq.len(),
            xb.len()
        )));
    }
    let (nq, nb) = (xq.len() / d, xb.len() / d);
    if dis.len() != nq * nb {
        return Err(QuantError::DimensionMismatch {
            expected: nq * nb,
            actual: dis.len(),
        });
    }
    if nq == 0 || nb == 0 {
        return Ok(());
    }
    dis.par_chunks_mut(nb)
        .zip(xq.par_chunks(d))
        .for_each(|(row, q)| {
            for (out, y) in row.iter_mut().zip(xb.chunks_exact(d)) {
                *out = vd.eval(q, y);
            }
        });
    Ok(())
}

fn knn_with<C: Comparator<T = f32>>(
    vd: &VectorDistance,
    x: &[f32],
    y: &[f32],
    k: usize,
    bitset: BitsetView<'_>,
    val: &mut [f32],
    ids: &mut [i64],
) {
    let d = vd.d;
    val.par_chunks_mut(k)
        .zip(ids.par_chunks_mut(k))
        .zip(x.par_chunks(d))
        .for_each(|((v, i), q)| {
            heap_heapify::<C>(k, v, i);
            for (j, yj) in y.chunks_exact(d).enumerate() {
                if bitset.test(j) {
                    continue;
                }
                heap_offer::<C>(v, i, vd.eval(q, yj), j as i64);
            }
            heap_reorder::<C>(k, v, i);
        });
}

/// Exact top-k search for any float metric.
///
/// Returns `(distances, labels)`, each `nx * k`, best first. Unfilled slots carry label `-1`.
pub fn knn_extra_metrics(
    x: &[f32],
    y: &[f32],
    d: usize,
    metric: MetricType,
    metric_arg: f32,
    k: usize,
    bitset: BitsetView<'_>,
) -> Result<(Vec<f32>, Vec<i64>)> {
    let vd = VectorDistance::new(metric, d, metric_arg)?;
    if d == 0 || x.len() % d != 0 || y.len() % d != 0 {
        return Err(QuantError::Configuration(format!(
            "input lengths {} / {} are not multiples of d = {d}",
            x.len(),
            y.len()
        )));
    }
    let nx = x.len() / d;
    let mut val = vec![0.0f32; nx * k];
    let mut ids = vec![-1i64; nx * k];
    if k == 0 || nx == 0 {
        return Ok((val, ids));
    }
    if metric.is_similarity() {
        knn_with::<CMin<f32>>(&vd, x, y, k, bitset, &mut val, &mut ids);
    } else {
        knn_with::<CMax<f32>>(&vd, x, y, k, bitset, &mut val, &mut ids);
    }
    Ok((val, ids))
}
