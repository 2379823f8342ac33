//! Centroid update and empty-cluster repair.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::TrainingSet;

/// Relative perturbation applied when a cluster is split, a bit above f16 epsilon.
const SPLIT_EPS: f32 = 1.0 / 1024.0;

/// Seed of the generator that picks which cluster to split.
const SPLIT_SEED: u64 = 1234;

/// Recompute the non-frozen centroids as the (weighted) mean of their assigned points.
///
/// `hassign` receives the (weighted) population of each non-frozen centroid and must have
/// length `k - k_frozen`. Each worker owns a contiguous range of centroids and scans every
/// point, so no two workers write the same centroid. Centroids with no points are left at
/// zero for [`split_clusters`] to repair.
pub(crate) fn compute_centroids(
    d: usize,
    k_frozen: usize,
    data: &TrainingSet<'_>,
    assign: &[i64],
    weights: Option<&[f32]>,
    hassign: &mut [f32],
    centroids: &mut [f32],
) {
    let k_free = hassign.len();
    let free = &mut centroids[k_frozen * d..];
    debug_assert_eq!(free.len(), k_free * d);
    free.fill(0.0);
    hassign.fill(0.0);

    let nt = rayon::current_num_threads().max(1);
    let mut parts = Vec::with_capacity(nt);
    let (mut rest_c, mut rest_h) = (free, &mut hassign[..]);
    for rank in 0..nt {
        let c0 = k_free * rank / nt;
        let c1 = k_free * (rank + 1) / nt;
        let (c, tail_c) = std::mem::take(&mut rest_c).split_at_mut((c1 - c0) * d);
        let (h, tail_h) = std::mem::take(&mut rest_h).split_at_mut(c1 - c0);
        rest_c = tail_c;
        rest_h = tail_h;
        parts.push((c0, c1, c, h));
    }

    parts.into_par_iter().for_each(|(c0, c1, cent, hist)| {
        if c0 == c1 {
            return;
        }
        let mut buf = vec![0.0f32; d];
        for (i, &a) in assign.iter().enumerate() {
            if a < 0 {
                continue;
            }
            let Some(ci) = (a as usize).checked_sub(k_frozen) else {
                continue;
            };
            if ci < c0 || ci >= c1 {
                continue;
            }
            let local = ci - c0;
            let xi = data.vector(i, &mut buf);
            let c = &mut cent[local * d..(local + 1) * d];
            match weights {
                Some(w) => {
                    let w = w[i];
                    hist[local] += w;
                    for (cj, &xj) in c.iter_mut().zip(xi) {
                        *cj += xj * w;
                    }
                }
                None => {
                    hist[local] += 1.0;
                    for (cj, &xj) in c.iter_mut().zip(xi) {
                        *cj += xj;
                    }
                }
            }
        }
    });

    centroids[k_frozen * d..]
        .par_chunks_mut(d)
        .zip(hassign.par_iter())
        .for_each(|(c, &h)| {
            if h != 0.0 {
                let norm = 1.0 / h;
                for v in c.iter_mut() {
                    *v *= norm;
                }
            }
        });
}

/// Give every empty non-frozen cluster half of a randomly chosen populated one.
///
/// The cluster to split is drawn with probability `(hassign[cj] - 1) / (n - k)`, cycling
/// over candidates until one is accepted. Both halves are nudged in opposite directions on
/// alternating coordinates so they separate on the next assignment. Returns the number of
/// splits.
pub(crate) fn split_clusters(
    d: usize,
    n: usize,
    k_frozen: usize,
    hassign: &mut [f32],
    centroids: &mut [f32],
) -> usize {
    let k = hassign.len();
    let cent = &mut centroids[k_frozen * d..];
    let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
    let mut nsplit = 0;
    let denom = n.saturating_sub(k).max(1) as f32;

    for ci in 0..k {
        if hassign[ci] != 0.0 {
            continue;
        }
        // every point may sit on a frozen centroid; then there is nothing to split
        if !hassign.iter().any(|&h| h > 1.0) {
            break;
        }
        let mut cj = 0;
        loop {
            let p = (hassign[cj] - 1.0) / denom;
            let r: f32 = rng.random();
            if r < p {
                break;
            }
            cj = (cj + 1) % k;
        }
        cent.copy_within(cj * d..(cj + 1) * d, ci * d);
        for j in 0..d {
            if j % 2 == 0 {
                cent[ci * d + j] *= 1.0 + SPLIT_EPS;
                cent[cj * d + j] *= 1.0 - SPLIT_EPS;
            } else {
                cent[ci * d + j] *= 1.0 - SPLIT_EPS;
                cent[cj * d + j] *= 1.0 + SPLIT_EPS;
            }
        }
        hassign[ci] = hassign[cj] / 2.0;
        hassign[cj] -= hassign[ci];
        nsplit += 1;
    }
    nsplit
}

/// `k * Σ h² / (Σ h)²` over the assignment histogram; 1.0 means perfectly balanced.
pub(crate) fn imbalance_factor(k: usize, assign: &[i64]) -> f64 {
    let mut hist = vec![0u64; k];
    for &a in assign {
        if a >= 0 && (a as usize) < k {
            hist[a as usize] += 1;
        }
    }
    let (mut tot, mut uf) = (0.0f64, 0.0f64);
    for &h in &hist {
        let h = h as f64;
        tot += h;
        uf += h * h;
    }
    if tot == 0.0 {
        return 1.0;
    }
    uf * k as f64 / (tot * tot)
}
