//! Initial centroid selection.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::simd;

/// Uniform random permutation of `0..n`.
pub fn random_permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    perm.shuffle(&mut rng);
    perm
}

/// k-means++ seeding over `nx` rows of `x`: indices of `k` chosen points.
///
/// The first center is uniform; each next one is drawn with probability proportional to
/// the squared distance to its nearest chosen center. Points are split into one static
/// chunk per worker; each chunk keeps its own prefix sum, so a draw first walks the chunk
/// totals and then binary-searches inside the selected chunk.
pub fn kmeans_plus_plus(x: &[f32], nx: usize, d: usize, k: usize, seed: u64) -> Vec<usize> {
    debug_assert!(nx > 0 && x.len() >= nx * d);
    let nt = rayon::current_num_threads().clamp(1, nx);
    let step = nx.div_ceil(nt);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut chosen = Vec::with_capacity(k);
    chosen.push(rng.random_range(0..nx));

    let mut min_dist = vec![f32::INFINITY; nx];
    let mut pre_sum = vec![0.0f32; nx];

    while chosen.len() < k {
        let last = chosen[chosen.len() - 1];
        let c = &x[last * d..(last + 1) * d];
        min_dist
            .par_iter_mut()
            .zip(x.par_chunks(d))
            .for_each(|(md, xi)| {
                let dis = simd::l2_sqr(xi, c);
                if dis < *md {
                    *md = dis;
                }
            });

        pre_sum
            .par_chunks_mut(step)
            .zip(min_dist.par_chunks(step))
            .for_each(|(ps, md)| {
                let mut acc = 0.0f32;
                for (p, &m) in ps.iter_mut().zip(md) {
                    acc += m;
                    *p = acc;
                }
            });

        let chunk_total = |t: usize| pre_sum[((t + 1) * step).min(nx) - 1];
        let nchunks = nx.div_ceil(step);
        let sum: f32 = (0..nchunks).map(chunk_total).sum();

        let mut target = (rng.random::<f64>() * f64::from(sum)) as f32;
        let mut t = 0;
        while t + 1 < nchunks {
            let total = chunk_total(t);
            if target - total <= 0.0 {
                break;
            }
            target -= total;
            t += 1;
        }

        let (mut left, mut right) = (t * step, ((t + 1) * step).min(nx));
        while left < right {
            let mid = left + (right - left) / 2;
            if pre_sum[mid] < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        chosen.push(left.min(nx - 1));
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_is_seeded() {
        let a = random_permutation(50, 7);
        let b = random_permutation(50, 7);
        assert_eq!(a, b);
        let mut s = a.clone();
        s.sort_unstable();
        assert_eq!(s, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn never_picks_zero_distance_point() {
        // two clusters of duplicates: the second pick must come from the other cluster
        let x = [0.0f32, 0.0, 0.0, 5.0, 5.0, 5.0];
        for seed in 0..50 {
            let idx = kmeans_plus_plus(&x, 6, 1, 2, seed);
            assert_ne!(x[idx[0]], x[idx[1]]);
        }
    }

    #[test]
    fn draw_probability_follows_squared_distance() {
        // points at 0, 1, 2, 3; whenever 0 is picked first the next pick should follow
        // weights 1 : 4 : 9
        let x = [0.0f32, 1.0, 2.0, 3.0];
        let mut counts = [0usize; 4];
        let mut trials = 0usize;
        for seed in 0..20_000u64 {
            let idx = kmeans_plus_plus(&x, 4, 1, 2, seed);
            if idx[0] == 0 {
                counts[idx[1]] += 1;
                trials += 1;
            }
        }
        assert!(trials > 3000);
        assert_eq!(counts[0], 0);
        for (i, w) in [(1usize, 1.0f64), (2, 4.0), (3, 9.0)] {
            let p = counts[i] as f64 / trials as f64;
            assert!((p - w / 14.0).abs() < 0.03, "point {i}: {p}");
        }
    }
}
