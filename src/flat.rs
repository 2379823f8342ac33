//! Exact flat index used to assign points to their nearest centroid.

use rayon::prelude::*;

use crate::distance::knn_extra_metrics;
use crate::error::{check_dim, QuantError, Result};
use crate::filtering::BitsetView;
use crate::metric::MetricType;
use crate::simd;

/// The index contract k-means needs: hold centroids and return the 1-NN of each point.
pub trait AssignIndex: Send + Sync {
    /// Vector dimension.
    fn dim(&self) -> usize;

    /// Metric used for assignment.
    fn metric(&self) -> MetricType;

    /// Number of stored vectors.
    fn ntotal(&self) -> usize;

    /// Whether [`AssignIndex::add`] may be called.
    fn is_trained(&self) -> bool {
        true
    }

    /// Train on `n` vectors (no-op for exact indexes).
    fn train(&mut self, x: &[f32], n: usize) -> Result<()> {
        let _ = (x, n);
        Ok(())
    }

    /// Append `n` vectors.
    fn add(&mut self, x: &[f32], n: usize) -> Result<()>;

    /// Drop all stored vectors.
    fn reset(&mut self);

    /// Nearest stored vector for each of the `n` rows of `x`: `(labels, distances)`.
    fn assign(&self, x: &[f32], n: usize) -> Result<(Vec<i64>, Vec<f32>)>;
}

/// Brute-force index over raw vectors.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    d: usize,
    metric: MetricType,
    metric_arg: f32,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Empty index of dimension `d`.
    #[must_use]
    pub fn new(d: usize, metric: MetricType) -> Self {
        Self {
            d,
            metric,
            metric_arg: 0.0,
            data: Vec::new(),
        }
    }

    /// Set the metric argument (`p` for `Lp`).
    #[must_use]
    pub fn with_metric_arg(mut self, metric_arg: f32) -> Self {
        self.metric_arg = metric_arg;
        self
    }

    /// Stored vectors, row-major.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    fn check_rows(&self, x: &[f32], n: usize) -> Result<()> {
        check_dim(n * self.d, x.len())
    }
}

impl AssignIndex for FlatIndex {
    fn dim(&self) -> usize {
        self.d
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn ntotal(&self) -> usize {
        if self.d == 0 {
            0
        } else {
            self.data.len() / self.d
        }
    }

    fn add(&mut self, x: &[f32], n: usize) -> Result<()> {
        self.check_rows(x, n)?;
        self.data.extend_from_slice(x);
        Ok(())
    }

    fn reset(&mut self) {
        self.data.clear();
    }

    fn assign(&self, x: &[f32], n: usize) -> Result<(Vec<i64>, Vec<f32>)> {
        self.check_rows(x, n)?;
        let nb = self.ntotal();
        if nb == 0 {
            return Err(QuantError::Configuration(
                "assign called on an empty index".into(),
            ));
        }
        let d = self.d;
        match self.metric {
            MetricType::L2 | MetricType::InnerProduct => {
                let ip = self.metric == MetricType::InnerProduct;
                let (labels, dis): (Vec<i64>, Vec<f32>) = x
                    .par_chunks(d)
                    .map_init(
                        || vec![0.0f32; nb],
                        |buf, q| {
                            if ip {
                                simd::inner_products_ny(buf, q, &self.data, d, nb);
                            } else {
                                simd::l2_sqr_ny(buf, q, &self.data, d, nb);
                            }
                            let mut best = 0;
                            for (j, &v) in buf.iter().enumerate().skip(1) {
                                let better = if ip { v > buf[best] } else { v < buf[best] };
                                if better {
                                    best = j;
                                }
                            }
                            (best as i64, buf[best])
                        },
                    )
                    .unzip();
                Ok((labels, dis))
            }
            m => {
                let (dis, labels) = knn_extra_metrics(
                    x,
                    &self.data,
                    d,
                    m,
                    self.metric_arg,
                    1,
                    BitsetView::empty(),
                )?;
                Ok((labels, dis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_nearest_l2() {
        let mut idx = FlatIndex::new(2, MetricType::L2);
        idx.add(&[0.0, 0.0, 10.0, 10.0], 2).unwrap();
        let (labels, dis) = idx.assign(&[1.0, 1.0, 9.0, 8.0], 2).unwrap();
        assert_eq!(labels, vec![0, 1]);
        assert_eq!(dis, vec![2.0, 5.0]);
    }

    #[test]
    fn inner_product_takes_max() {
        let mut idx = FlatIndex::new(2, MetricType::InnerProduct);
        idx.add(&[1.0, 0.0, 0.0, 1.0], 2).unwrap();
        let (labels, dis) = idx.assign(&[0.2, 0.9], 1).unwrap();
        assert_eq!(labels, vec![1]);
        assert!((dis[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn extra_metric_path() {
        let mut idx = FlatIndex::new(1, MetricType::L1);
        idx.add(&[0.0, 4.0], 2).unwrap();
        let (labels, _) = idx.assign(&[3.0], 1).unwrap();
        assert_eq!(labels, vec![1]);
    }

    #[test]
    fn shape_and_state_errors() {
        let mut idx = FlatIndex::new(3, MetricType::L2);
        assert!(idx.add(&[0.0; 4], 2).is_err());
        assert!(idx.assign(&[0.0; 3], 1).is_err());
        idx.add(&[0.0; 3], 1).unwrap();
        idx.reset();
        assert_eq!(idx.ntotal(), 0);
    }
}
