//! Residual quantization.
//!
//! A vector is approximated by a sum of `M` centroids, one from each codebook, where codebook
//! `m` has `K_m = 2^nbits[m]` entries and is trained on what the previous codebooks left over.
//! Encoding keeps a beam of the best partial codes per vector instead of committing greedily.
//!
//! ```
//! use quantscan::residual::{ResidualQuantizer, TrainType};
//! use rand::{rngs::StdRng, Rng, SeedableRng};
//!
//! let (d, n) = (4, 300);
//! let mut rng = StdRng::seed_from_u64(0);
//! let x: Vec<f32> = (0..n * d).map(|_| rng.random_range(-1.0..1.0)).collect();
//!
//! let mut rq = ResidualQuantizer::with_uniform(d, 2, 4)?;
//! rq.train_type = TrainType::default().with_progressive_dim(false);
//! rq.train(&x, n)?;
//! let codes = rq.compute_codes(&x, n)?;
//! assert_eq!(codes.len(), n * rq.code_size());
//! let recons = rq.decode(&codes, n)?;
//! assert_eq!(recons.len(), n * d);
//! # Ok::<(), quantscan::QuantError>(())
//! ```

mod beam;
mod bitstring;

pub use beam::{beam_search_encode_step, beam_search_encode_step_tab};
pub use bitstring::{BitstringReader, BitstringWriter};

use std::borrow::Cow;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::clustering::{
    Clustering, Decoder, FlatL2Factory, ProgressiveDimClustering,
    ProgressiveDimClusteringParameters,
};
use crate::error::{check_dim, QuantError, Result};
use crate::flat::FlatIndex;
use crate::metric::MetricType;
use crate::simd;

/// Largest supported codebook size, in bits.
pub const MAX_NBITS: usize = 16;

/// How each codebook is trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainType {
    /// Use progressive-dimension k-means instead of plain k-means.
    pub progressive_dim: bool,
    /// Train each codebook on the best beam entry only, not on the whole beam.
    pub top_beam: bool,
    /// Do not build the cross-product tables after training.
    pub skip_codebook_tables: bool,
}

impl Default for TrainType {
    fn default() -> Self {
        Self {
            progressive_dim: true,
            top_beam: false,
            skip_codebook_tables: false,
        }
    }
}

impl TrainType {
    /// Toggle progressive-dimension training.
    #[must_use]
    pub fn with_progressive_dim(mut self, on: bool) -> Self {
        self.progressive_dim = on;
        self
    }

    /// Toggle top-beam training.
    #[must_use]
    pub fn with_top_beam(mut self, on: bool) -> Self {
        self.top_beam = on;
        self
    }

    /// Toggle building the codebook tables.
    #[must_use]
    pub fn with_skip_codebook_tables(mut self, on: bool) -> Self {
        self.skip_codebook_tables = on;
        self
    }
}

/// Output of a beam search: `beam_size` candidate encodings per vector, best first.
#[derive(Debug, Clone, Default)]
pub struct Beam {
    /// Entries per vector.
    pub beam_size: usize,
    /// Sub-codes per entry.
    pub m: usize,
    /// `(n, beam_size, m)` sub-codes.
    pub codes: Vec<i32>,
    /// `(n, beam_size, d)` residuals; empty for table-based searches.
    pub residuals: Vec<f32>,
    /// `(n, beam_size)` squared reconstruction errors.
    pub distances: Vec<f32>,
}

impl Beam {
    /// Sub-codes of the best entry of vector `i`.
    #[must_use]
    pub fn best_codes(&self, i: usize) -> &[i32] {
        let start = i * self.beam_size * self.m;
        &self.codes[start..start + self.m]
    }
}

/// Additive quantizer trained stage by stage on residuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualQuantizer {
    d: usize,
    nbits: Vec<usize>,
    /// Cumulative codebook sizes, `M + 1` entries.
    codebook_offsets: Vec<usize>,
    /// `total_codebook_size * d`, codebooks concatenated.
    codebooks: Vec<f32>,
    code_size: usize,
    is_trained: bool,
    /// Training variant.
    pub train_type: TrainType,
    /// Beam width used by training and encoding.
    pub max_beam_size: usize,
    /// Encode from the cross-product tables instead of explicit residuals.
    pub use_beam_lut: bool,
    /// Budget, in bytes, for temporary beam buffers; larger inputs are processed in batches.
    pub max_mem_distances: usize,
    /// Parameters of the per-stage clustering.
    pub cp: ProgressiveDimClusteringParameters,
    /// `<c_i, c_j>` for all pairs of codebook entries, `total^2`.
    codebook_cross_products: Vec<f32>,
    /// `|c_i|^2` for all codebook entries.
    cent_norms: Vec<f32>,
    norm_min: f32,
    norm_max: f32,
}

impl ResidualQuantizer {
    /// Quantizer with one codebook of `2^nbits[m]` entries per stage.
    pub fn new(d: usize, nbits: &[usize]) -> Result<Self> {
        if d == 0 || nbits.is_empty() {
            return Err(QuantError::Configuration(
                "residual quantizer needs d > 0 and at least one codebook".into(),
            ));
        }
        if let Some(&b) = nbits.iter().find(|&&b| b == 0 || b > MAX_NBITS) {
            return Err(QuantError::Configuration(format!(
                "codebook bits must be in 1..={MAX_NBITS}, got {b}"
            )));
        }
        let mut codebook_offsets = Vec::with_capacity(nbits.len() + 1);
        codebook_offsets.push(0);
        let mut total = 0usize;
        for &b in nbits {
            total += 1 << b;
            codebook_offsets.push(total);
        }
        let tot_bits: usize = nbits.iter().sum();
        Ok(Self {
            d,
            nbits: nbits.to_vec(),
            codebook_offsets,
            codebooks: Vec::new(),
            code_size: tot_bits.div_ceil(8),
            is_trained: false,
            train_type: TrainType::default(),
            max_beam_size: 5,
            use_beam_lut: false,
            max_mem_distances: 5 << 30,
            cp: ProgressiveDimClusteringParameters::default(),
            codebook_cross_products: Vec::new(),
            cent_norms: Vec::new(),
            norm_min: f32::INFINITY,
            norm_max: f32::NEG_INFINITY,
        })
    }

    /// `m` codebooks of `2^nbits` entries each.
    pub fn with_uniform(d: usize, m: usize, nbits: usize) -> Result<Self> {
        Self::new(d, &vec![nbits; m])
    }

    /// Vector dimension.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.d
    }

    /// Number of codebooks.
    #[must_use]
    pub fn num_codebooks(&self) -> usize {
        self.nbits.len()
    }

    /// Bits per codebook.
    #[must_use]
    pub fn nbits(&self) -> &[usize] {
        &self.nbits
    }

    /// Bytes per packed code.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Whether the codebooks are trained.
    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    /// Sum of all codebook sizes.
    #[must_use]
    pub fn total_codebook_size(&self) -> usize {
        self.codebook_offsets[self.nbits.len()]
    }

    /// Cumulative codebook sizes.
    #[must_use]
    pub fn codebook_offsets(&self) -> &[usize] {
        &self.codebook_offsets
    }

    /// All codebooks, concatenated.
    #[must_use]
    pub fn codebooks(&self) -> &[f32] {
        &self.codebooks
    }

    /// Entries of codebook `m`, `K_m * d`.
    #[must_use]
    pub fn codebook(&self, m: usize) -> &[f32] {
        let d = self.d;
        &self.codebooks[self.codebook_offsets[m] * d..self.codebook_offsets[m + 1] * d]
    }

    /// Cross products of all codebook entries; empty until computed.
    #[must_use]
    pub fn codebook_cross_products(&self) -> &[f32] {
        &self.codebook_cross_products
    }

    /// Squared norms of all codebook entries; empty until computed.
    #[must_use]
    pub fn cent_norms(&self) -> &[f32] {
        &self.cent_norms
    }

    /// Range of squared reconstruction norms seen during training.
    #[must_use]
    pub fn norm_range(&self) -> (f32, f32) {
        (self.norm_min, self.norm_max)
    }

    /// Replace the codebooks, e.g. with ones trained elsewhere.
    pub fn set_codebooks(&mut self, codebooks: Vec<f32>) -> Result<()> {
        check_dim(self.total_codebook_size() * self.d, codebooks.len())?;
        self.codebooks = codebooks;
        self.is_trained = true;
        self.codebook_cross_products.clear();
        self.cent_norms.clear();
        if !self.train_type.skip_codebook_tables {
            self.compute_codebook_tables();
        }
        Ok(())
    }

    /// Temporary bytes per vector for a beam of `beam_size`: two residual beams plus one
    /// candidate table of distances and ids.
    #[must_use]
    pub fn memory_per_point(&self, beam_size: usize) -> usize {
        let mut mem = beam_size * self.d * 2 * std::mem::size_of::<f32>();
        mem += beam_size
            * beam_size
            * (std::mem::size_of::<f32>() + std::mem::size_of::<i64>());
        mem
    }

    fn batch_size(&self, n: usize) -> usize {
        let mem = self.memory_per_point(self.max_beam_size);
        if n > 1 && mem * n > self.max_mem_distances {
            (self.max_mem_distances / mem).max(1)
        } else {
            n
        }
    }

    fn check_beam_width(&self) -> Result<()> {
        if self.max_beam_size == 0 {
            return Err(QuantError::Configuration(
                "max_beam_size must be positive".into(),
            ));
        }
        Ok(())
    }

    fn check_trained(&self) -> Result<()> {
        if self.is_trained {
            Ok(())
        } else {
            Err(QuantError::Configuration(
                "residual quantizer is not trained".into(),
            ))
        }
    }

    fn train_codebook(&self, k: usize, x: &[f32], n: usize) -> Result<(Vec<f32>, f32)> {
        let d = self.d;
        if self.train_type.progressive_dim {
            let mut clus = ProgressiveDimClustering::with_params(d, k, self.cp.clone());
            clus.train(x, n, &FlatL2Factory)?;
            let obj = clus.iteration_stats().last().map_or(0.0, |s| s.obj);
            Ok((clus.into_centroids(), obj))
        } else {
            let mut clus = Clustering::with_params(d, k, self.cp.cp.clone());
            let mut index = FlatIndex::new(d, MetricType::L2);
            clus.train(x, n, &mut index, None)?;
            let obj = clus.iteration_stats().last().map_or(0.0, |s| s.obj);
            Ok((clus.into_centroids(), obj))
        }
    }

    /// Train all codebooks on `n` rows of `x`.
    pub fn train(&mut self, x: &[f32], n: usize) -> Result<()> {
        let d = self.d;
        check_dim(n * d, x.len())?;
        self.check_beam_width()?;
        if n == 0 {
            return Ok(());
        }

        self.codebooks = vec![0.0; self.total_codebook_size() * d];
        let mut cur_beam = 1usize;
        let mut residuals = x.to_vec();
        let mut codes: Vec<i32> = Vec::new();
        let mut distances: Vec<f32> = Vec::new();

        for m in 0..self.nbits.len() {
            let k = 1usize << self.nbits[m];

            let train_residuals: Cow<'_, [f32]> = if self.train_type.top_beam {
                Cow::Owned(
                    residuals
                        .chunks_exact(cur_beam * d)
                        .flat_map(|beam| beam[..d].iter().copied())
                        .collect(),
                )
            } else {
                Cow::Borrowed(&residuals)
            };
            let nt = train_residuals.len() / d;
            let (cb, obj) = self.train_codebook(k, &train_residuals, nt)?;
            drop(train_residuals);
            let off = self.codebook_offsets[m] * d;
            self.codebooks[off..off + k * d].copy_from_slice(&cb);

            let new_beam = (cur_beam * k).min(self.max_beam_size);
            let mut new_codes = vec![0i32; n * new_beam * (m + 1)];
            let mut new_residuals = vec![0.0f32; n * new_beam * d];
            let mut new_distances = vec![0.0f32; n * new_beam];

            let bs = self.batch_size(n);
            for i0 in (0..n).step_by(bs) {
                let i1 = (i0 + bs).min(n);
                beam_search_encode_step(
                    d,
                    k,
                    &cb,
                    i1 - i0,
                    cur_beam,
                    &residuals[i0 * cur_beam * d..i1 * cur_beam * d],
                    m,
                    &codes[i0 * cur_beam * m..i1 * cur_beam * m],
                    new_beam,
                    &mut new_codes[i0 * new_beam * (m + 1)..i1 * new_beam * (m + 1)],
                    &mut new_residuals[i0 * new_beam * d..i1 * new_beam * d],
                    &mut new_distances[i0 * new_beam..i1 * new_beam],
                )?;
            }
            codes = new_codes;
            residuals = new_residuals;
            distances = new_distances;

            let total: f64 = distances.iter().map(|&v| f64::from(v)).sum();
            log::debug!(
                "rq stage {m}: {} bits, kmeans objective {obj}, total distance {total}, beam {cur_beam} -> {new_beam} (batch size {bs})",
                self.nbits[m]
            );
            cur_beam = new_beam;
        }

        // squared norm of each reconstruction, x - best residual
        self.norm_min = f32::INFINITY;
        self.norm_max = f32::NEG_INFINITY;
        for (xi, beam) in x.chunks_exact(d).zip(residuals.chunks_exact(cur_beam * d)) {
            let norm = simd::l2_sqr(xi, &beam[..d]);
            self.norm_min = self.norm_min.min(norm);
            self.norm_max = self.norm_max.max(norm);
        }
        if let Some(mse) = distances
            .chunks_exact(cur_beam)
            .map(|b| f64::from(b[0]))
            .reduce(|a, b| a + b)
        {
            log::debug!("rq trained, mean squared error {}", mse / n as f64);
        }

        self.is_trained = true;
        self.codebook_cross_products.clear();
        self.cent_norms.clear();
        if !self.train_type.skip_codebook_tables {
            self.compute_codebook_tables();
        }
        Ok(())
    }

    /// Fill the cross-product table and the centroid norms.
    pub fn compute_codebook_tables(&mut self) {
        let (d, total) = (self.d, self.total_codebook_size());
        let mut cross = vec![0.0f32; total * total];
        let codebooks = &self.codebooks;
        cross
            .par_chunks_mut(total)
            .enumerate()
            .for_each(|(i, row)| {
                simd::inner_products_ny(row, &codebooks[i * d..(i + 1) * d], codebooks, d, total);
            });
        self.cent_norms = (0..total).map(|i| cross[i * total + i]).collect();
        self.codebook_cross_products = cross;
    }

    /// Inner products of `n` queries with every codebook entry, `n * total_codebook_size`.
    pub fn compute_lut(&self, x: &[f32], n: usize) -> Result<Vec<f32>> {
        self.check_trained()?;
        let (d, total) = (self.d, self.total_codebook_size());
        check_dim(n * d, x.len())?;
        let mut lut = vec![0.0f32; n * total];
        lut.par_chunks_mut(total)
            .zip(x.par_chunks(d))
            .for_each(|(row, xi)| simd::inner_products_ny(row, xi, &self.codebooks, d, total));
        Ok(lut)
    }

    /// Beam search with explicit residuals, keeping up to `beam_size` entries per vector.
    pub fn refine_beam(&self, x: &[f32], n: usize, beam_size: usize) -> Result<Beam> {
        self.check_trained()?;
        let d = self.d;
        check_dim(n * d, x.len())?;
        if beam_size == 0 {
            return Err(QuantError::Configuration("beam size must be positive".into()));
        }

        let mut cur_beam = 1usize;
        let mut residuals = x.to_vec();
        let mut codes: Vec<i32> = Vec::new();
        let mut distances: Vec<f32> = Vec::new();
        for m in 0..self.nbits.len() {
            let k = 1usize << self.nbits[m];
            let new_beam = (cur_beam * k).min(beam_size);
            let mut new_codes = vec![0i32; n * new_beam * (m + 1)];
            let mut new_residuals = vec![0.0f32; n * new_beam * d];
            distances = vec![0.0f32; n * new_beam];
            beam_search_encode_step(
                d,
                k,
                self.codebook(m),
                n,
                cur_beam,
                &residuals,
                m,
                &codes,
                new_beam,
                &mut new_codes,
                &mut new_residuals,
                &mut distances,
            )?;
            codes = new_codes;
            residuals = new_residuals;
            cur_beam = new_beam;
        }
        Ok(Beam {
            beam_size: cur_beam,
            m: self.nbits.len(),
            codes,
            residuals,
            distances,
        })
    }

    /// Beam search from the cross-product tables; needs [`Self::compute_codebook_tables`].
    pub fn refine_beam_lut(&self, x: &[f32], n: usize, beam_size: usize) -> Result<Beam> {
        self.check_trained()?;
        let (d, total) = (self.d, self.total_codebook_size());
        check_dim(n * d, x.len())?;
        if beam_size == 0 {
            return Err(QuantError::Configuration("beam size must be positive".into()));
        }
        if self.codebook_cross_products.len() != total * total {
            return Err(QuantError::Configuration(
                "codebook tables are missing, call compute_codebook_tables first".into(),
            ));
        }

        let query_cp = self.compute_lut(x, n)?;
        let mut distances = simd::norms_sqr(x, d, n);
        let mut cur_beam = 1usize;
        let mut codes: Vec<i32> = Vec::new();
        for m in 0..self.nbits.len() {
            let k = 1usize << self.nbits[m];
            let off = self.codebook_offsets[m];
            let new_beam = (cur_beam * k).min(beam_size);
            let mut new_codes = vec![0i32; n * new_beam * (m + 1)];
            let mut new_distances = vec![0.0f32; n * new_beam];
            beam_search_encode_step_tab(
                k,
                n,
                cur_beam,
                &self.codebook_cross_products[off..],
                total,
                &self.codebook_offsets,
                &query_cp[off..],
                total,
                &self.cent_norms[off..],
                m,
                &codes,
                &distances,
                new_beam,
                &mut new_codes,
                &mut new_distances,
            )?;
            codes = new_codes;
            distances = new_distances;
            cur_beam = new_beam;
        }
        Ok(Beam {
            beam_size: cur_beam,
            m: self.nbits.len(),
            codes,
            residuals: Vec::new(),
            distances,
        })
    }

    /// Encode `n` rows of `x` into `n * code_size` bytes.
    pub fn compute_codes(&self, x: &[f32], n: usize) -> Result<Vec<u8>> {
        self.check_trained()?;
        self.check_beam_width()?;
        let d = self.d;
        check_dim(n * d, x.len())?;
        let mut out = vec![0u8; n * self.code_size];
        if n == 0 {
            return Ok(out);
        }
        let bs = self.batch_size(n);
        for i0 in (0..n).step_by(bs) {
            let i1 = (i0 + bs).min(n);
            let xb = &x[i0 * d..i1 * d];
            let beam = if self.use_beam_lut {
                self.refine_beam_lut(xb, i1 - i0, self.max_beam_size)?
            } else {
                self.refine_beam(xb, i1 - i0, self.max_beam_size)?
            };
            let ld = beam.beam_size * beam.m;
            self.pack_into(
                &beam.codes,
                i1 - i0,
                ld,
                &mut out[i0 * self.code_size..i1 * self.code_size],
            );
        }
        Ok(out)
    }

    fn pack_into(&self, codes: &[i32], n: usize, ld_codes: usize, out: &mut [u8]) {
        for (i, code) in out.chunks_exact_mut(self.code_size).take(n).enumerate() {
            let mut w = BitstringWriter::new(code);
            for (m, &nb) in self.nbits.iter().enumerate() {
                w.write(codes[i * ld_codes + m] as u64, nb);
            }
        }
    }

    /// Pack `n` rows of sub-codes, row `i` starting at `i * ld_codes`.
    pub fn pack_codes(&self, codes: &[i32], n: usize, ld_codes: usize) -> Result<Vec<u8>> {
        let m = self.nbits.len();
        if ld_codes < m || (n > 0 && codes.len() < (n - 1) * ld_codes + m) {
            return Err(QuantError::Configuration(format!(
                "cannot pack {n} codes of {m} entries with stride {ld_codes} from {} values",
                codes.len()
            )));
        }
        for i in 0..n {
            for (j, &nb) in self.nbits.iter().enumerate() {
                let c = codes[i * ld_codes + j];
                if c < 0 || c as usize >= 1 << nb {
                    return Err(QuantError::InvalidInput(format!(
                        "sub-code {c} of vector {i} does not fit in {nb} bits"
                    )));
                }
            }
        }
        let mut out = vec![0u8; n * self.code_size];
        self.pack_into(codes, n, ld_codes, &mut out);
        Ok(out)
    }

    /// Split `n` packed codes back into `n * M` sub-codes.
    pub fn unpack_codes(&self, codes: &[u8], n: usize) -> Result<Vec<i32>> {
        check_dim(n * self.code_size, codes.len())?;
        let mut out = Vec::with_capacity(n * self.nbits.len());
        for code in codes.chunks_exact(self.code_size) {
            let mut r = BitstringReader::new(code);
            out.extend(self.nbits.iter().map(|&nb| r.read(nb) as i32));
        }
        Ok(out)
    }

    /// Reconstruct `n` vectors from their packed codes.
    pub fn decode(&self, codes: &[u8], n: usize) -> Result<Vec<f32>> {
        self.check_trained()?;
        check_dim(n * self.code_size, codes.len())?;
        let mut out = vec![0.0f32; n * self.d];
        self.decode_unchecked(codes, &mut out);
        Ok(out)
    }

    fn decode_unchecked(&self, codes: &[u8], out: &mut [f32]) {
        let d = self.d;
        out.par_chunks_mut(d)
            .zip(codes.par_chunks(self.code_size))
            .for_each(|(xi, code)| {
                let mut r = BitstringReader::new(code);
                for (m, &nb) in self.nbits.iter().enumerate() {
                    let idx = self.codebook_offsets[m] + r.read(nb) as usize;
                    let c = &self.codebooks[idx * d..(idx + 1) * d];
                    if m == 0 {
                        xi.copy_from_slice(c);
                    } else {
                        for (o, &v) in xi.iter_mut().zip(c) {
                            *o += v;
                        }
                    }
                }
            });
    }
}

impl Decoder for ResidualQuantizer {
    fn dim(&self) -> usize {
        self.d
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn decode_into(&self, codes: &[u8], out: &mut [f32]) {
        self.decode_unchecked(codes, out);
    }
}
