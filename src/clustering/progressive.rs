//! Progressive-dimension k-means.
//!
//! Clusters in a growing number of leading (PCA) dimensions, `d_i = floor(d^((1+i)/steps))`,
//! warm-starting every step from the previous centroids padded with zeros. Useful when `k`
//! is large relative to `n`, where plain k-means tends to get stuck early.

use serde::{Deserialize, Serialize};

use super::{Clustering, ClusteringParameters, ClusteringType, IterationStats, PcaMatrix};
use crate::error::{check_dim, QuantError, Result};
use crate::flat::{AssignIndex, FlatIndex};
use crate::metric::MetricType;

/// Builds the assignment index for each dimension step.
pub trait AssignIndexFactory: Sync {
    /// A fresh, empty index of dimension `d`.
    fn create(&self, d: usize) -> Box<dyn AssignIndex>;
}

/// Exact L2 flat index for every step.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatL2Factory;

impl AssignIndexFactory for FlatL2Factory {
    fn create(&self, d: usize) -> Box<dyn AssignIndex> {
        Box::new(FlatIndex::new(d, MetricType::L2))
    }
}

impl<F> AssignIndexFactory for F
where
    F: Fn(usize) -> Box<dyn AssignIndex> + Sync,
{
    fn create(&self, d: usize) -> Box<dyn AssignIndex> {
        self(d)
    }
}

/// Configuration of [`ProgressiveDimClustering`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressiveDimClusteringParameters {
    /// Parameters of each k-means step (default `niter = 10`).
    pub cp: ClusteringParameters,
    /// Number of dimension steps.
    pub progressive_dim_steps: usize,
    /// Rotate the input onto its principal axes first.
    pub apply_pca: bool,
}

impl Default for ProgressiveDimClusteringParameters {
    fn default() -> Self {
        Self {
            cp: ClusteringParameters::default().with_niter(10),
            progressive_dim_steps: 10,
            apply_pca: true,
        }
    }
}

impl ProgressiveDimClusteringParameters {
    /// Set the number of steps.
    #[must_use]
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.progressive_dim_steps = steps;
        self
    }

    /// Enable or disable PCA.
    #[must_use]
    pub fn with_pca(mut self, apply_pca: bool) -> Self {
        self.apply_pca = apply_pca;
        self
    }
}

/// k-means in progressively more dimensions.
#[derive(Debug, Clone)]
pub struct ProgressiveDimClustering {
    /// Vector dimension.
    pub d: usize,
    /// Number of centroids.
    pub k: usize,
    /// Configuration.
    pub params: ProgressiveDimClusteringParameters,
    centroids: Vec<f32>,
    iteration_stats: Vec<IterationStats>,
}

/// Copy the first `min(d1, d2)` columns of `n` rows of width `d1` into rows of width `d2`,
/// zero-filling the rest.
fn copy_columns(n: usize, d1: usize, src: &[f32], d2: usize) -> Vec<f32> {
    let d = d1.min(d2);
    let mut out = vec![0.0f32; n * d2];
    if d == 0 {
        return out;
    }
    for (dst, row) in out.chunks_exact_mut(d2).zip(src.chunks_exact(d1)) {
        dst[..d].copy_from_slice(&row[..d]);
    }
    out
}

impl ProgressiveDimClustering {
    /// Trainer with default parameters.
    #[must_use]
    pub fn new(d: usize, k: usize) -> Self {
        Self::with_params(d, k, ProgressiveDimClusteringParameters::default())
    }

    /// Trainer with explicit parameters.
    #[must_use]
    pub fn with_params(d: usize, k: usize, params: ProgressiveDimClusteringParameters) -> Self {
        Self {
            d,
            k,
            params,
            centroids: Vec::new(),
            iteration_stats: Vec::new(),
        }
    }

    /// Trained centroids, `k * d`, in the input space.
    #[must_use]
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Take ownership of the centroids.
    #[must_use]
    pub fn into_centroids(self) -> Vec<f32> {
        self.centroids
    }

    /// Statistics of every step, concatenated.
    #[must_use]
    pub fn iteration_stats(&self) -> &[IterationStats] {
        &self.iteration_stats
    }

    /// Train on `n` rows of `x`.
    pub fn train(&mut self, x: &[f32], n: usize, factory: &dyn AssignIndexFactory) -> Result<()> {
        let (d, k) = (self.d, self.k);
        check_dim(n * d, x.len())?;
        let steps = self.params.progressive_dim_steps;
        if steps == 0 || d == 0 {
            return Err(QuantError::Configuration(
                "progressive_dim_steps and d must be positive".into(),
            ));
        }

        let mut pca = PcaMatrix::new(d, d);
        let rotated;
        let x = if self.params.apply_pca {
            pca.train(x, n)?;
            rotated = pca.apply(x, n)?;
            &rotated[..]
        } else {
            x
        };

        self.iteration_stats.clear();
        let mut d_prev = 0;
        let mut centroids: Vec<f32> = Vec::new();
        for step in 0..steps {
            let di = ((d as f64).powf((1.0 + step as f64) / steps as f64) as usize).clamp(1, d);
            let mut cp = self.params.cp.clone();
            if d_prev > 0 {
                // warm start: all k centroids are given, nothing left to seed
                cp.clustering_type = ClusteringType::KMeans;
            }
            let mut clus = Clustering::with_params(di, k, cp);
            if d_prev > 0 {
                clus.set_centroids(copy_columns(k, d_prev, &centroids, di))?;
            }
            let xsub = copy_columns(n, d, x, di);
            let mut index = factory.create(di);
            clus.train(&xsub, n, index.as_mut(), None)?;
            log::debug!("progressive dim step {step}: d = {di}");
            self.iteration_stats
                .extend_from_slice(clus.iteration_stats());
            centroids = clus.into_centroids();
            d_prev = di;
        }

        if d_prev < d {
            centroids = copy_columns(k, d_prev, &centroids, d);
        }
        self.centroids = if self.params.apply_pca {
            pca.reverse_transform(&centroids, k)?
        } else {
            centroids
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn data(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * d)
            .map(|i| {
                let blob = ((i / d) % 4) as f32 * 8.0;
                blob + rng.random_range(-1.0..1.0) * (1.0 + (i % d) as f32 * 0.1)
            })
            .collect()
    }

    #[test]
    fn copy_columns_pads_and_truncates() {
        let src = [1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(copy_columns(2, 2, &src, 3), vec![1.0, 2.0, 0.0, 3.0, 4.0, 0.0]);
        assert_eq!(copy_columns(2, 2, &src, 1), vec![1.0, 3.0]);
    }

    #[test]
    fn trains_in_full_dimension() {
        let (n, d, k) = (400, 8, 4);
        let x = data(n, d, 1);
        let params = ProgressiveDimClusteringParameters::default().with_steps(4);
        let mut pdc = ProgressiveDimClustering::with_params(d, k, params);
        pdc.train(&x, n, &FlatL2Factory).unwrap();
        assert_eq!(pdc.centroids().len(), k * d);
        assert!(!pdc.iteration_stats().is_empty());
        assert!(pdc.centroids().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn closure_factory_without_pca() {
        let (n, d, k) = (200, 4, 4);
        let x = data(n, d, 2);
        let params = ProgressiveDimClusteringParameters::default()
            .with_steps(2)
            .with_pca(false);
        let mut pdc = ProgressiveDimClustering::with_params(d, k, params);
        let factory = |di: usize| -> Box<dyn AssignIndex> {
            Box::new(FlatIndex::new(di, MetricType::L2))
        };
        pdc.train(&x, n, &factory).unwrap();
        assert_eq!(pdc.centroids().len(), k * d);
    }
}
