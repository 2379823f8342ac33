//! k-means clustering.
//!
//! [`Clustering`] trains `k` centroids over `n` vectors of dimension `d`, using an
//! [`AssignIndex`] for the nearest-centroid search. It is the engine behind codebook
//! training in [`crate::residual`], and is usable on its own.
//!
//! # Algorithm
//!
//! 1. Validate everything up front (`n >= k`, dimensions, finite input, weights).
//! 2. Subsample to `k * max_points_per_centroid` points when there are more.
//! 3. `n == k`: the points are the centroids. One zero-cost iteration is recorded.
//! 4. For each restart: seed (random or k-means++), then iterate assign / update /
//!    split empty clusters / post-process, stopping early when the relative objective
//!    drop falls under `early_stop_threshold` percent.
//! 5. Keep the best restart (lowest objective, or highest for inner product).
//!
//! # Example
//!
//! ```rust
//! use quantscan::clustering::kmeans_clustering;
//!
//! let x: Vec<f32> = (0..200).map(|i| (i % 2) as f32 * 10.0 + (i as f32) * 1e-3).collect();
//! let (centroids, _obj) = kmeans_clustering(1, 200, 2, &x).unwrap();
//! assert_eq!(centroids.len(), 2);
//! ```

mod centroids;
mod pca;
mod progressive;
mod seeding;

pub use pca::PcaMatrix;
pub use progressive::{
    AssignIndexFactory, FlatL2Factory, ProgressiveDimClustering,
    ProgressiveDimClusteringParameters,
};
pub use seeding::{kmeans_plus_plus, random_permutation};

use std::borrow::Cow;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{check_dim, QuantError, Result};
use crate::flat::{AssignIndex, FlatIndex};
use crate::interrupt::InterruptFlag;
use crate::metric::MetricType;
use crate::simd;

use centroids::{compute_centroids, imbalance_factor, split_clusters};

/// How initial centroids are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusteringType {
    /// Distinct points drawn uniformly at random.
    #[default]
    KMeans,
    /// Distance-weighted sampling (k-means++). Incompatible with pre-set centroids.
    KMeansPlusPlus,
}

/// Clustering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringParameters {
    /// Iterations per restart.
    pub niter: usize,
    /// Number of restarts; the best one is kept.
    pub nredo: usize,
    /// Log every iteration at debug level.
    pub verbose: bool,
    /// L2-normalize centroids after each update.
    pub spherical: bool,
    /// Round centroid coordinates to the nearest integer.
    pub int_centroids: bool,
    /// Retrain the assignment index after each iteration.
    pub update_index: bool,
    /// Keep pre-set centroids fixed during iterations.
    pub frozen_centroids: bool,
    /// Below `k * min_points_per_centroid` points a warning is logged.
    pub min_points_per_centroid: usize,
    /// Above `k * max_points_per_centroid` points the input is subsampled.
    pub max_points_per_centroid: usize,
    /// Seed for subsampling and seeding.
    pub seed: u64,
    /// Vectors decoded at a time when training on encoded input.
    pub decode_block_size: usize,
    /// Seeding strategy.
    pub clustering_type: ClusteringType,
    /// Stop when the relative objective drop, in percent, is below this.
    pub early_stop_threshold: f64,
    /// Polled after each assignment pass and each iteration.
    #[serde(skip)]
    pub interrupt: InterruptFlag,
}

impl Default for ClusteringParameters {
    fn default() -> Self {
        Self {
            niter: 25,
            nredo: 1,
            verbose: false,
            spherical: false,
            int_centroids: false,
            update_index: false,
            frozen_centroids: false,
            min_points_per_centroid: 39,
            max_points_per_centroid: 256,
            seed: 1234,
            decode_block_size: 32768,
            clustering_type: ClusteringType::KMeans,
            early_stop_threshold: 0.0,
            interrupt: InterruptFlag::new(),
        }
    }
}

impl ClusteringParameters {
    /// Set the iteration count.
    #[must_use]
    pub fn with_niter(mut self, niter: usize) -> Self {
        self.niter = niter;
        self
    }

    /// Set the number of restarts.
    #[must_use]
    pub fn with_nredo(mut self, nredo: usize) -> Self {
        self.nredo = nredo;
        self
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the seeding strategy.
    #[must_use]
    pub fn with_clustering_type(mut self, clustering_type: ClusteringType) -> Self {
        self.clustering_type = clustering_type;
        self
    }

    /// Set the early-stop threshold (percent).
    #[must_use]
    pub fn with_early_stop_threshold(mut self, threshold: f64) -> Self {
        self.early_stop_threshold = threshold;
        self
    }

    /// Set the subsampling bound.
    #[must_use]
    pub fn with_max_points_per_centroid(mut self, max_ppc: usize) -> Self {
        self.max_points_per_centroid = max_ppc;
        self
    }

    /// Normalize centroids.
    #[must_use]
    pub fn with_spherical(mut self, spherical: bool) -> Self {
        self.spherical = spherical;
        self
    }

    /// Use a caller-owned interrupt flag.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// One record per k-means iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    /// Sum of assignment distances.
    pub obj: f32,
    /// Seconds since the start of the iterations.
    pub time: f64,
    /// Seconds spent in assignment so far.
    pub time_search: f64,
    /// `k * Σ h² / (Σ h)²` over cluster sizes; 1.0 is perfectly balanced.
    pub imbalance_factor: f64,
    /// Number of empty clusters repaired.
    pub nsplit: usize,
}

/// Something that can turn fixed-size codes back into vectors.
pub trait Decoder: Sync {
    /// Output dimension.
    fn dim(&self) -> usize;

    /// Bytes per code.
    fn code_size(&self) -> usize;

    /// Decode `codes.len() / code_size()` codes into `out`.
    fn decode_into(&self, codes: &[u8], out: &mut [f32]);
}

/// Training input, possibly subsampled (owned) or borrowed from the caller.
pub(crate) enum TrainingSet<'a> {
    Floats { x: Cow<'a, [f32]>, d: usize },
    Codes { codes: Cow<'a, [u8]>, codec: &'a dyn Decoder },
}

impl<'a> TrainingSet<'a> {
    fn line_size(&self) -> usize {
        match self {
            Self::Floats { d, .. } => *d,
            Self::Codes { codec, .. } => codec.code_size(),
        }
    }

    /// Vector `i`, decoded into `buf` when needed.
    pub(crate) fn vector<'b>(&'b self, i: usize, buf: &'b mut [f32]) -> &'b [f32] {
        match self {
            Self::Floats { x, d } => &x[i * d..(i + 1) * d],
            Self::Codes { codes, codec } => {
                let cs = codec.code_size();
                codec.decode_into(&codes[i * cs..(i + 1) * cs], buf);
                buf
            }
        }
    }

    /// Decode rows `i0..i1` into `out`.
    fn rows_into(&self, i0: usize, i1: usize, out: &mut [f32]) {
        match self {
            Self::Floats { x, d } => out.copy_from_slice(&x[i0 * d..i1 * d]),
            Self::Codes { codes, codec } => {
                let cs = codec.code_size();
                codec.decode_into(&codes[i0 * cs..i1 * cs], out);
            }
        }
    }

    /// Keep the first `nsub` entries of `perm`.
    fn subsample(&self, perm: &[usize], nsub: usize) -> TrainingSet<'a> {
        let ls = self.line_size();
        match self {
            Self::Floats { x, d } => {
                let mut out = Vec::with_capacity(nsub * ls);
                for &p in &perm[..nsub] {
                    out.extend_from_slice(&x[p * ls..(p + 1) * ls]);
                }
                TrainingSet::Floats {
                    x: Cow::Owned(out),
                    d: *d,
                }
            }
            Self::Codes { codes, codec } => {
                let mut out = Vec::with_capacity(nsub * ls);
                for &p in &perm[..nsub] {
                    out.extend_from_slice(&codes[p * ls..(p + 1) * ls]);
                }
                TrainingSet::Codes {
                    codes: Cow::Owned(out),
                    codec: *codec,
                }
            }
        }
    }
}

/// k-means trainer.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Vector dimension.
    pub d: usize,
    /// Number of centroids.
    pub k: usize,
    /// Configuration.
    pub params: ClusteringParameters,
    centroids: Vec<f32>,
    iteration_stats: Vec<IterationStats>,
}

impl Clustering {
    /// Trainer with default parameters.
    #[must_use]
    pub fn new(d: usize, k: usize) -> Self {
        Self::with_params(d, k, ClusteringParameters::default())
    }

    /// Trainer with explicit parameters.
    #[must_use]
    pub fn with_params(d: usize, k: usize, params: ClusteringParameters) -> Self {
        Self {
            d,
            k,
            params,
            centroids: Vec::new(),
            iteration_stats: Vec::new(),
        }
    }

    /// Provide initial centroids (row-major, at most `k` rows). With
    /// `frozen_centroids` they stay fixed; otherwise they only replace seeding.
    pub fn set_centroids(&mut self, centroids: Vec<f32>) -> Result<()> {
        if self.d == 0 || centroids.len() % self.d != 0 {
            return Err(QuantError::Configuration(format!(
                "{} input centroid values are not a multiple of d = {}",
                centroids.len(),
                self.d
            )));
        }
        if centroids.len() > self.k * self.d {
            return Err(QuantError::Configuration(format!(
                "{} input centroids for k = {}",
                centroids.len() / self.d,
                self.k
            )));
        }
        self.centroids = centroids;
        Ok(())
    }

    /// Trained centroids, `k * d`.
    #[must_use]
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Take ownership of the centroids.
    #[must_use]
    pub fn into_centroids(self) -> Vec<f32> {
        self.centroids
    }

    /// Per-iteration statistics of the kept restart (and the restarts before it).
    #[must_use]
    pub fn iteration_stats(&self) -> &[IterationStats] {
        &self.iteration_stats
    }

    /// Apply spherical normalization and integer rounding, as configured.
    pub fn post_process_centroids(&mut self) {
        if self.params.spherical {
            let n = self.centroids.len() / self.d.max(1);
            simd::renorm_l2(self.d, n, &mut self.centroids);
        }
        if self.params.int_centroids {
            for c in &mut self.centroids {
                *c = c.round();
            }
        }
    }

    /// Train on `n` float vectors.
    pub fn train(
        &mut self,
        x: &[f32],
        n: usize,
        index: &mut dyn AssignIndex,
        weights: Option<&[f32]>,
    ) -> Result<()> {
        check_dim(n * self.d, x.len())?;
        if let Some(pos) = x.iter().position(|v| !v.is_finite()) {
            return Err(QuantError::InvalidInput(format!(
                "input contains NaN or Inf (vector {}, component {})",
                pos / self.d.max(1),
                pos % self.d.max(1)
            )));
        }
        let data = TrainingSet::Floats {
            x: Cow::Borrowed(x),
            d: self.d,
        };
        self.train_set(data, n, index, weights)
    }

    /// Train on `n` encoded vectors, decoding them with `codec` as needed.
    pub fn train_encoded(
        &mut self,
        codes: &[u8],
        n: usize,
        codec: &dyn Decoder,
        index: &mut dyn AssignIndex,
        weights: Option<&[f32]>,
    ) -> Result<()> {
        check_dim(self.d, codec.dim())?;
        check_dim(n * codec.code_size(), codes.len())?;
        let data = TrainingSet::Codes {
            codes: Cow::Borrowed(codes),
            codec,
        };
        self.train_set(data, n, index, weights)
    }

    fn validate(&self, n: usize, index: &dyn AssignIndex, weights: Option<&[f32]>) -> Result<()> {
        let (d, k) = (self.d, self.k);
        if d == 0 || k == 0 {
            return Err(QuantError::Configuration(format!(
                "d = {d} and k = {k} must both be positive"
            )));
        }
        if n < k {
            return Err(QuantError::Configuration(format!(
                "number of training points ({n}) should be at least as large as number of clusters ({k})"
            )));
        }
        check_dim(d, index.dim())?;
        if let Some(w) = weights {
            check_dim(n, w.len())?;
        }
        if self.centroids.len() % d != 0 {
            return Err(QuantError::Configuration(
                "size of provided input centroids not a multiple of dimension".into(),
            ));
        }
        if self.params.clustering_type == ClusteringType::KMeansPlusPlus
            && !self.centroids.is_empty()
        {
            return Err(QuantError::Configuration(
                "k-means++ seeding does not support pre-set centroids".into(),
            ));
        }
        if self.params.nredo == 0 {
            return Err(QuantError::Configuration("nredo must be at least 1".into()));
        }
        Ok(())
    }

    fn train_set(
        &mut self,
        data: TrainingSet<'_>,
        n: usize,
        index: &mut dyn AssignIndex,
        weights: Option<&[f32]>,
    ) -> Result<()> {
        self.validate(n, index, weights)?;
        let (d, k) = (self.d, self.k);
        let p = self.params.clone();

        let mut data = data;
        let mut weights: Option<Cow<'_, [f32]>> = weights.map(Cow::Borrowed);
        let mut nx = n;
        if nx > k * p.max_points_per_centroid {
            let nsub = k * p.max_points_per_centroid;
            log::info!("sampling a subset of {nsub} / {nx} points for training");
            let perm = random_permutation(nx, p.seed);
            weights = weights.map(|w| Cow::Owned(perm[..nsub].iter().map(|&i| w[i]).collect()));
            data = data.subsample(&perm, nsub);
            nx = nsub;
        } else if nx < k * p.min_points_per_centroid {
            log::warn!(
                "clustering {nx} points to {k} centroids: please provide at least {} training points",
                k * p.min_points_per_centroid
            );
        }
        let weights = weights.as_deref();

        if nx == k {
            log::debug!("number of training points ({nx}) same as number of clusters, copying");
            let mut c = vec![0.0f32; k * d];
            data.rows_into(0, k, &mut c);
            self.centroids = c;
            self.iteration_stats.push(IterationStats {
                obj: 0.0,
                time: 0.0,
                time_search: 0.0,
                imbalance_factor: 1.0,
                nsplit: 0,
            });
            index.reset();
            index.add(&self.centroids, k)?;
            return Ok(());
        }

        if p.verbose {
            log::debug!(
                "clustering {nx} points in {d}D to {k} clusters, redo {} times, {} iterations",
                p.nredo,
                p.niter
            );
        }

        let lower_is_better = index.metric() != MetricType::InnerProduct;
        let mut best_obj = if lower_is_better {
            f32::INFINITY
        } else {
            f32::NEG_INFINITY
        };
        let mut best_stats = Vec::new();
        let mut best_centroids = Vec::new();

        let n_input = self.centroids.len() / d;
        let k_frozen = if p.frozen_centroids { n_input } else { 0 };
        let input_centroids = std::mem::take(&mut self.centroids);

        // k-means++ needs float rows
        let plusplus_rows: Option<Vec<f32>> = match (&data, p.clustering_type) {
            (TrainingSet::Codes { .. }, ClusteringType::KMeansPlusPlus) => {
                let mut buf = vec![0.0f32; nx * d];
                data.rows_into(0, nx, &mut buf);
                Some(buf)
            }
            _ => None,
        };

        let mut assign = vec![0i64; nx];
        let mut dis = vec![0.0f32; nx];
        let mut decode_buffer = match data {
            TrainingSet::Codes { .. } => vec![0.0f32; d * p.decode_block_size.max(1)],
            TrainingSet::Floats { .. } => Vec::new(),
        };
        let t0 = Instant::now();
        let mut t_search = 0.0f64;
        let mut interrupted = false;

        for redo in 0..p.nredo {
            if p.nredo > 1 {
                log::info!("outer iteration {redo} / {}", p.nredo);
            }

            let random_seed = p
                .seed
                .wrapping_add(1)
                .wrapping_add((redo as u64).wrapping_mul(15_486_557));
            let seeds = match p.clustering_type {
                ClusteringType::KMeans => random_permutation(nx, random_seed),
                ClusteringType::KMeansPlusPlus => {
                    let rows: &[f32] = match (&plusplus_rows, &data) {
                        (Some(r), _) => &r[..],
                        (None, TrainingSet::Floats { x, .. }) => &x[..],
                        (None, TrainingSet::Codes { .. }) => &[],
                    };
                    kmeans_plus_plus(rows, nx, d, k, random_seed)
                }
            };
            self.centroids = input_centroids.clone();
            self.centroids.resize(k * d, 0.0);
            for i in n_input..k {
                data.rows_into(
                    seeds[i],
                    seeds[i] + 1,
                    &mut self.centroids[i * d..(i + 1) * d],
                );
            }
            self.post_process_centroids();

            if index.ntotal() != 0 {
                index.reset();
            }
            if !index.is_trained() {
                index.train(&self.centroids, k)?;
            }
            index.add(&self.centroids, k)?;

            let mut obj = 0.0f32;
            let mut prev_objective = 0.0f32;
            for i in 0..p.niter {
                let t0s = Instant::now();
                match &data {
                    TrainingSet::Floats { x, .. } => {
                        let (a, dd) = index.assign(x, nx)?;
                        assign = a;
                        dis = dd;
                    }
                    TrainingSet::Codes { .. } => {
                        let bs = p.decode_block_size.max(1);
                        let mut i0 = 0;
                        while i0 < nx {
                            let i1 = (i0 + bs).min(nx);
                            let buf = &mut decode_buffer[..(i1 - i0) * d];
                            data.rows_into(i0, i1, buf);
                            let (a, dd) = index.assign(buf, i1 - i0)?;
                            assign[i0..i1].copy_from_slice(&a);
                            dis[i0..i1].copy_from_slice(&dd);
                            i0 = i1;
                        }
                    }
                }
                let stop_requested = p.interrupt.is_set();
                t_search += t0s.elapsed().as_secs_f64();

                obj = dis.iter().sum();

                let mut hassign = vec![0.0f32; k - k_frozen];
                compute_centroids(
                    d,
                    k_frozen,
                    &data,
                    &assign,
                    weights,
                    &mut hassign,
                    &mut self.centroids,
                );
                let nsplit = split_clusters(d, nx, k_frozen, &mut hassign, &mut self.centroids);

                let stats = IterationStats {
                    obj,
                    time: t0.elapsed().as_secs_f64(),
                    time_search: t_search,
                    imbalance_factor: imbalance_factor(k, &assign),
                    nsplit,
                };
                self.iteration_stats.push(stats);
                if p.verbose {
                    log::debug!(
                        "iteration {i} ({:.2} s, search {:.2} s): objective={} imbalance={:.3} nsplit={nsplit}",
                        stats.time,
                        stats.time_search,
                        stats.obj,
                        stats.imbalance_factor
                    );
                }

                self.post_process_centroids();

                index.reset();
                if p.update_index {
                    index.train(&self.centroids, k)?;
                }
                index.add(&self.centroids, k)?;

                let diff = if prev_objective == 0.0 {
                    f32::MAX
                } else {
                    (prev_objective - stats.obj) / prev_objective
                };
                prev_objective = stats.obj;
                if f64::from(diff) < p.early_stop_threshold / 100.0 {
                    break;
                }

                if stop_requested || p.interrupt.is_set() {
                    log::info!("clustering interrupted after iteration {i}");
                    interrupted = true;
                    break;
                }
            }

            if p.nredo > 1 {
                let improved = if lower_is_better {
                    obj < best_obj
                } else {
                    obj > best_obj
                };
                if improved {
                    log::info!("objective improved: keep new clusters");
                    best_centroids.clone_from(&self.centroids);
                    best_stats.clone_from(&self.iteration_stats);
                    best_obj = obj;
                }
                index.reset();
            }
            if interrupted {
                break;
            }
        }

        if p.nredo > 1 {
            self.centroids = best_centroids;
            self.iteration_stats = best_stats;
            index.reset();
            index.add(&self.centroids, k)?;
        }
        Ok(())
    }
}

/// Cluster `n` vectors into `k` centroids with default parameters and an L2 flat index.
///
/// Returns the centroids and the objective of the last iteration.
pub fn kmeans_clustering(d: usize, n: usize, k: usize, x: &[f32]) -> Result<(Vec<f32>, f32)> {
    let mut clus = Clustering::new(d, k);
    let mut index = FlatIndex::new(d, MetricType::L2);
    clus.train(x, n, &mut index, None)?;
    let obj = clus.iteration_stats().last().map_or(0.0, |s| s.obj);
    Ok((clus.into_centroids(), obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Three tight, well separated blobs in 2D.
    fn blobs(per: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers = [(0.0f32, 0.0f32), (20.0, 0.0), (0.0, 20.0)];
        let mut x = Vec::with_capacity(per * 6);
        for &(cx, cy) in &centers {
            for _ in 0..per {
                x.push(cx + rng.random_range(-1.0..1.0));
                x.push(cy + rng.random_range(-1.0..1.0));
            }
        }
        x
    }

    #[test]
    fn n_equals_k_copies_input() {
        let x = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut clus = Clustering::new(2, 3);
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 3, &mut index, None).unwrap();
        assert_eq!(clus.centroids(), &x);
        assert_eq!(clus.iteration_stats().len(), 1);
        assert_eq!(clus.iteration_stats()[0].imbalance_factor, 1.0);
        assert_eq!(index.ntotal(), 3);
    }

    #[test]
    fn finds_blobs_and_objective_does_not_increase() {
        let x = blobs(100, 3);
        let params = ClusteringParameters::default()
            .with_niter(15)
            .with_clustering_type(ClusteringType::KMeansPlusPlus);
        let mut clus = Clustering::with_params(2, 3, params);
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 300, &mut index, None).unwrap();

        let stats = clus.iteration_stats();
        for w in stats.windows(2) {
            assert!(w[1].obj <= w[0].obj * (1.0 + 1e-5), "{} > {}", w[1].obj, w[0].obj);
        }
        let mut found = [false; 3];
        for c in clus.centroids().chunks(2) {
            for (i, t) in [(0.0, 0.0), (20.0, 0.0), (0.0, 20.0)].iter().enumerate() {
                if (c[0] - t.0).abs() < 1.5 && (c[1] - t.1).abs() < 1.5 {
                    found[i] = true;
                }
            }
        }
        assert_eq!(found, [true; 3]);
    }

    #[test]
    fn rejects_bad_input() {
        let mut index = FlatIndex::new(2, MetricType::L2);
        let mut clus = Clustering::new(2, 4);
        let err = clus.train(&[0.0; 4], 2, &mut index, None).unwrap_err();
        assert!(matches!(err, QuantError::Configuration(_)));

        let mut x = vec![0.0f32; 20];
        x[7] = f32::NAN;
        let err = clus.train(&x, 10, &mut index, None).unwrap_err();
        assert!(matches!(err, QuantError::InvalidInput(_)));

        let mut wrong = FlatIndex::new(3, MetricType::L2);
        let err = clus.train(&[0.0; 20], 10, &mut wrong, None).unwrap_err();
        assert!(matches!(err, QuantError::DimensionMismatch { .. }));
    }

    #[test]
    fn plusplus_rejects_preset_centroids() {
        let params =
            ClusteringParameters::default().with_clustering_type(ClusteringType::KMeansPlusPlus);
        let mut clus = Clustering::with_params(1, 2, params);
        clus.set_centroids(vec![0.5]).unwrap();
        let mut index = FlatIndex::new(1, MetricType::L2);
        let err = clus.train(&[0.0, 1.0, 2.0, 3.0], 4, &mut index, None).unwrap_err();
        assert!(matches!(err, QuantError::Configuration(_)));
    }

    #[test]
    fn frozen_centroids_stay_put() {
        let x = blobs(50, 9);
        let mut params = ClusteringParameters::default().with_niter(5);
        params.frozen_centroids = true;
        let mut clus = Clustering::with_params(2, 3, params);
        clus.set_centroids(vec![-100.0, -100.0]).unwrap();
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 150, &mut index, None).unwrap();
        assert_eq!(&clus.centroids()[..2], &[-100.0, -100.0]);
    }

    #[test]
    fn restarts_keep_best_and_interrupt_stops_early() {
        let x = blobs(60, 1);
        let params = ClusteringParameters::default().with_niter(4).with_nredo(3);
        let mut clus = Clustering::with_params(2, 3, params);
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 180, &mut index, None).unwrap();
        assert!(!clus.iteration_stats().is_empty());
        assert_eq!(index.ntotal(), 3);

        let flag = InterruptFlag::new();
        flag.interrupt();
        let params = ClusteringParameters::default()
            .with_niter(10)
            .with_interrupt(flag);
        let mut clus = Clustering::with_params(2, 3, params);
        clus.train(&x, 180, &mut index, None).unwrap();
        assert_eq!(clus.iteration_stats().len(), 1);
        assert_eq!(clus.centroids().len(), 6);
    }

    #[test]
    fn early_stop_needs_two_iterations() {
        let x = blobs(40, 5);
        let params = ClusteringParameters::default()
            .with_niter(20)
            .with_early_stop_threshold(100.0);
        let mut clus = Clustering::with_params(2, 3, params);
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 120, &mut index, None).unwrap();
        // first iteration never stops (previous objective is zero), second always does
        assert_eq!(clus.iteration_stats().len(), 2);
    }

    #[test]
    fn subsampling_caps_training_set() {
        let x = blobs(200, 11);
        let params = ClusteringParameters::default()
            .with_niter(3)
            .with_max_points_per_centroid(20);
        let mut clus = Clustering::with_params(2, 3, params);
        let mut index = FlatIndex::new(2, MetricType::L2);
        clus.train(&x, 600, &mut index, None).unwrap();
        assert_eq!(clus.centroids().len(), 6);
    }

    struct Halves;

    impl Decoder for Halves {
        fn dim(&self) -> usize {
            1
        }
        fn code_size(&self) -> usize {
            1
        }
        fn decode_into(&self, codes: &[u8], out: &mut [f32]) {
            for (o, &c) in out.iter_mut().zip(codes) {
                *o = f32::from(c) * 0.5;
            }
        }
    }

    #[test]
    fn trains_on_encoded_input() {
        let codes: Vec<u8> = (0..60).map(|i| if i < 30 { 2 } else { 200 }).collect();
        let mut clus = Clustering::with_params(1, 2, ClusteringParameters::default().with_niter(5));
        let mut index = FlatIndex::new(1, MetricType::L2);
        clus.train_encoded(&codes, 60, &Halves, &mut index, None).unwrap();
        let mut c = clus.centroids().to_vec();
        c.sort_by(f32::total_cmp);
        assert!((c[0] - 1.0).abs() < 1e-4 && (c[1] - 100.0).abs() < 1e-3, "{c:?}");
    }

    #[test]
    fn convenience_wrapper() {
        let x = blobs(30, 2);
        let (c, obj) = kmeans_clustering(2, 90, 3, &x).unwrap();
        assert_eq!(c.len(), 6);
        assert!(obj >= 0.0);
    }
}
