//! Principal component analysis for progressive-dimension clustering.
//!
//! Eigen decomposition of the covariance matrix uses cyclic Jacobi rotations in `f64`,
//! which is plenty for the dimensions codebooks are trained in.

use crate::error::{check_dim, QuantError, Result};

const JACOBI_MAX_SWEEPS: usize = 64;

/// Linear map `y = V (x - mean)` onto the principal axes, sorted by decreasing variance.
#[derive(Debug, Clone, Default)]
pub struct PcaMatrix {
    d_in: usize,
    d_out: usize,
    mean: Vec<f32>,
    /// `d_out` rows of length `d_in`.
    components: Vec<f32>,
    eigenvalues: Vec<f32>,
}

impl PcaMatrix {
    /// Untrained map from `d_in` to `d_out` dimensions.
    #[must_use]
    pub fn new(d_in: usize, d_out: usize) -> Self {
        Self {
            d_in,
            d_out,
            ..Default::default()
        }
    }

    /// Whether [`PcaMatrix::train`] has run.
    #[must_use]
    pub fn is_trained(&self) -> bool {
        !self.components.is_empty()
    }

    /// Eigenvalues of the kept components, largest first.
    #[must_use]
    pub fn eigenvalues(&self) -> &[f32] {
        &self.eigenvalues
    }

    /// Fit mean and principal axes on `n` rows of `x`.
    pub fn train(&mut self, x: &[f32], n: usize) -> Result<()> {
        let d = self.d_in;
        check_dim(n * d, x.len())?;
        if self.d_out == 0 || self.d_out > d || n == 0 {
            return Err(QuantError::Configuration(format!(
                "cannot fit PCA {} -> {} on {n} points",
                d, self.d_out
            )));
        }

        let mut mean = vec![0.0f64; d];
        for row in x.chunks_exact(d) {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += f64::from(v);
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut cov = vec![0.0f64; d * d];
        let mut centered = vec![0.0f64; d];
        for row in x.chunks_exact(d) {
            for ((c, &v), &m) in centered.iter_mut().zip(row).zip(&mean) {
                *c = f64::from(v) - m;
            }
            for i in 0..d {
                let ci = centered[i];
                for j in i..d {
                    cov[i * d + j] += ci * centered[j];
                }
            }
        }
        for i in 0..d {
            for j in i..d {
                cov[i * d + j] /= n as f64;
                cov[j * d + i] = cov[i * d + j];
            }
        }

        let (evals, evecs) = jacobi_eigen(cov, d);
        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| evals[b].total_cmp(&evals[a]));

        self.mean = mean.iter().map(|&m| m as f32).collect();
        self.components = Vec::with_capacity(self.d_out * d);
        self.eigenvalues = Vec::with_capacity(self.d_out);
        for &c in order.iter().take(self.d_out) {
            // eigenvectors are the columns of `evecs`
            self.components
                .extend((0..d).map(|r| evecs[r * d + c] as f32));
            self.eigenvalues.push(evals[c] as f32);
        }
        Ok(())
    }

    /// Project `n` rows of `x`.
    pub fn apply(&self, x: &[f32], n: usize) -> Result<Vec<f32>> {
        self.check_trained()?;
        check_dim(n * self.d_in, x.len())?;
        let mut out = vec![0.0f32; n * self.d_out];
        let mut centered = vec![0.0f32; self.d_in];
        for (row, y) in x.chunks_exact(self.d_in).zip(out.chunks_exact_mut(self.d_out)) {
            for ((c, &v), &m) in centered.iter_mut().zip(row).zip(&self.mean) {
                *c = v - m;
            }
            for (yo, comp) in y.iter_mut().zip(self.components.chunks_exact(self.d_in)) {
                *yo = crate::simd::dot(comp, &centered);
            }
        }
        Ok(out)
    }

    /// Map `n` projected rows back to the input space.
    pub fn reverse_transform(&self, y: &[f32], n: usize) -> Result<Vec<f32>> {
        self.check_trained()?;
        check_dim(n * self.d_out, y.len())?;
        let mut out = Vec::with_capacity(n * self.d_in);
        for row in y.chunks_exact(self.d_out) {
            let mut x = self.mean.clone();
            for (&coef, comp) in row.iter().zip(self.components.chunks_exact(self.d_in)) {
                for (xi, &ci) in x.iter_mut().zip(comp) {
                    *xi += coef * ci;
                }
            }
            out.extend_from_slice(&x);
        }
        Ok(out)
    }

    fn check_trained(&self) -> Result<()> {
        if self.is_trained() {
            Ok(())
        } else {
            Err(QuantError::Configuration("PCA matrix is not trained".into()))
        }
    }
}

/// Eigen decomposition of a symmetric `d × d` matrix: `(eigenvalues, eigenvectors as columns)`.
fn jacobi_eigen(mut a: Vec<f64>, d: usize) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0f64; d * d];
    for i in 0..d {
        v[i * d + i] = 1.0;
    }
    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..d)
            .flat_map(|i| (0..d).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i * d + j] * a[i * d + j])
            .sum();
        let diag: f64 = (0..d).map(|i| a[i * d + i] * a[i * d + i]).sum();
        if off <= 1e-22 * diag.max(f64::MIN_POSITIVE) {
            break;
        }
        for p in 0..d {
            for q in p + 1..d {
                let apq = a[p * d + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * d + q] - a[p * d + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for r in 0..d {
                    let arp = a[r * d + p];
                    let arq = a[r * d + q];
                    a[r * d + p] = c * arp - s * arq;
                    a[r * d + q] = s * arp + c * arq;
                }
                for r in 0..d {
                    let apr = a[p * d + r];
                    let aqr = a[q * d + r];
                    a[p * d + r] = c * apr - s * aqr;
                    a[q * d + r] = s * apr + c * aqr;
                }
                for r in 0..d {
                    let vrp = v[r * d + p];
                    let vrq = v[r * d + q];
                    v[r * d + p] = c * vrp - s * vrq;
                    v[r * d + q] = s * vrp + c * vrq;
                }
            }
        }
    }
    ((0..d).map(|i| a[i * d + i]).collect(), v)
}
