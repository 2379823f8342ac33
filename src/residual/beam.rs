//! One step of beam search over a codebook.
//!
//! Both functions extend every beam entry with each of the `K` centroids of the current
//! codebook, score the `beam_size * K` candidates and keep the `new_beam_size` best,
//! sorted by increasing distance. Candidate `b * K + k` extends beam entry `b` with
//! centroid `k`; equal distances keep the lower candidate index.

use rayon::prelude::*;

use crate::error::{QuantError, Result};
use crate::heap::{heap_heapify, heap_offer, heap_reorder, CMax};
use crate::simd;

type Cmp = CMax<f32>;

fn check_beam(beam_size: usize, k: usize, new_beam_size: usize) -> Result<()> {
    if new_beam_size == 0 || new_beam_size > beam_size * k {
        return Err(QuantError::Configuration(format!(
            "new beam size {new_beam_size} must be in 1..={} (beam {beam_size} x K {k})",
            beam_size * k
        )));
    }
    Ok(())
}

/// Keep the `new_beam_size` smallest of `cand`; returns candidate indices, best first.
fn select(cand: &[f32], new_beam_size: usize, dis: &mut [f32]) -> Vec<i64> {
    let mut ids = vec![-1i64; new_beam_size];
    heap_heapify::<Cmp>(new_beam_size, dis, &mut ids);
    for (j, &v) in cand.iter().enumerate() {
        heap_offer::<Cmp>(dis, &mut ids, v, j as i64);
    }
    heap_reorder::<Cmp>(new_beam_size, dis, &mut ids);
    ids
}

/// Beam search step with explicit residuals.
///
/// Shapes: `residuals` `(n, beam_size, d)`, `codes` `(n, beam_size, m)`, `cent` `(K, d)`;
/// outputs `new_codes` `(n, new_beam_size, m + 1)`, `new_residuals`
/// `(n, new_beam_size, d)`, `new_distances` `(n, new_beam_size)`. Distances are the
/// squared norms of the new residuals.
#[allow(clippy::too_many_arguments)]
pub fn beam_search_encode_step(
    d: usize,
    k: usize,
    cent: &[f32],
    n: usize,
    beam_size: usize,
    residuals: &[f32],
    m: usize,
    codes: &[i32],
    new_beam_size: usize,
    new_codes: &mut [i32],
    new_residuals: &mut [f32],
    new_distances: &mut [f32],
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    check_beam(beam_size, k, new_beam_size)?;
    if cent.len() != k * d
        || residuals.len() < n * beam_size * d
        || codes.len() < n * beam_size * m
        || new_codes.len() < n * new_beam_size * (m + 1)
        || new_residuals.len() < n * new_beam_size * d
        || new_distances.len() < n * new_beam_size
    {
        return Err(QuantError::Configuration(
            "beam search buffers do not match the declared shapes".into(),
        ));
    }

    new_distances[..n * new_beam_size]
        .par_chunks_mut(new_beam_size)
        .zip(new_residuals[..n * new_beam_size * d].par_chunks_mut(new_beam_size * d))
        .zip(new_codes[..n * new_beam_size * (m + 1)].par_chunks_mut(new_beam_size * (m + 1)))
        .enumerate()
        .for_each(|(i, ((dis, res_out), codes_out))| {
            let res_i = &residuals[i * beam_size * d..(i + 1) * beam_size * d];
            let codes_i = &codes[i * beam_size * m..(i + 1) * beam_size * m];
            let mut cand = vec![0.0f32; beam_size * k];
            for (b, row) in cand.chunks_exact_mut(k).enumerate() {
                simd::l2_sqr_ny(row, &res_i[b * d..(b + 1) * d], cent, d, k);
            }
            let perm = select(&cand, new_beam_size, dis);
            for (j, &p) in perm.iter().enumerate() {
                let p = p as usize;
                let (js, ls) = (p / k, p % k);
                let out = &mut codes_out[j * (m + 1)..(j + 1) * (m + 1)];
                out[..m].copy_from_slice(&codes_i[js * m..(js + 1) * m]);
                out[m] = ls as i32;
                let r = &res_i[js * d..(js + 1) * d];
                let c = &cent[ls * d..(ls + 1) * d];
                for ((o, &a), &b) in res_out[j * d..(j + 1) * d].iter_mut().zip(r).zip(c) {
                    *o = a - b;
                }
            }
        });
    Ok(())
}

/// Beam search step using precomputed dot products instead of residuals.
///
/// `codebook_cross_norms` starts at the column of the first centroid of this codebook in
/// the `(total, ldc)` cross-product table, so entry `r * ldc + k` is
/// `<centroid r, centroid k of this codebook>`. `query_cp` is likewise offset: entry
/// `i * ldqc + k` is `<x_i, centroid k>`. `distances` holds the current squared residual
/// norm of each beam entry (the squared query norm for the first step).
///
/// The candidate distance is
/// `distances[b] + |c_k|^2 - 2 <x, c_k> + 2 Σ_{m' < m} <c_{m'}, c_k>`.
#[allow(clippy::too_many_arguments)]
pub fn beam_search_encode_step_tab(
    k: usize,
    n: usize,
    beam_size: usize,
    codebook_cross_norms: &[f32],
    ldc: usize,
    codebook_offsets: &[usize],
    query_cp: &[f32],
    ldqc: usize,
    cent_norms_i: &[f32],
    m: usize,
    codes: &[i32],
    distances: &[f32],
    new_beam_size: usize,
    new_codes: &mut [i32],
    new_distances: &mut [f32],
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    check_beam(beam_size, k, new_beam_size)?;
    if ldc < k || ldqc < k || cent_norms_i.len() < k || codebook_offsets.len() < m {
        return Err(QuantError::Configuration(format!(
            "table strides ldc = {ldc}, ldqc = {ldqc} must be at least K = {k}"
        )));
    }
    if codes.len() < n * beam_size * m
        || distances.len() < n * beam_size
        || new_codes.len() < n * new_beam_size * (m + 1)
        || new_distances.len() < n * new_beam_size
    {
        return Err(QuantError::Configuration(
            "beam search buffers do not match the declared shapes".into(),
        ));
    }

    new_distances[..n * new_beam_size]
        .par_chunks_mut(new_beam_size)
        .zip(new_codes[..n * new_beam_size * (m + 1)].par_chunks_mut(new_beam_size * (m + 1)))
        .enumerate()
        .for_each(|(i, (dis, codes_out))| {
            let codes_i = &codes[i * beam_size * m..(i + 1) * beam_size * m];
            let qcp = &query_cp[i * ldqc..i * ldqc + k];
            let dis_i = &distances[i * beam_size..(i + 1) * beam_size];

            let cd_common: Vec<f32> = cent_norms_i[..k]
                .iter()
                .zip(qcp)
                .map(|(&cn, &q)| cn - 2.0 * q)
                .collect();

            let mut cand = vec![0.0f32; beam_size * k];
            let mut dp = vec![0.0f32; k];
            for (b, row) in cand.chunks_exact_mut(k).enumerate() {
                dp.fill(0.0);
                for (m1, &c) in codes_i[b * m..(b + 1) * m].iter().enumerate() {
                    let r = codebook_offsets[m1] + c as usize;
                    for (acc, &x) in dp.iter_mut().zip(&codebook_cross_norms[r * ldc..r * ldc + k]) {
                        *acc += x;
                    }
                }
                for ((out, &common), &x) in row.iter_mut().zip(&cd_common).zip(&dp) {
                    *out = dis_i[b] + common + 2.0 * x;
                }
            }

            let perm = select(&cand, new_beam_size, dis);
            for (j, &p) in perm.iter().enumerate() {
                let p = p as usize;
                let (js, ls) = (p / k, p % k);
                let out = &mut codes_out[j * (m + 1)..(j + 1) * (m + 1)];
                out[..m].copy_from_slice(&codes_i[js * m..(js + 1) * m]);
                out[m] = ls as i32;
            }
        });
    Ok(())
}
