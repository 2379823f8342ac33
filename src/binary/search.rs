//! Exact scans over binary code databases.
//!
//! Two parallel layouts produce identical results:
//!
//! - *query-major*: the database is split in one contiguous chunk per worker, each worker
//!   keeps private results for every query, and the chunks are merged in database order.
//!   Good when there are few queries and a large database.
//! - *database-major*: the database is walked in cache-sized tiles and, for each tile,
//!   queries are spread across workers, each owning its own result row.
//!
//! Heaps break value ties by id, so the merge order does not change the outcome.

use rayon::prelude::*;

use super::computers::BinaryComputer;
use super::{BinarySearchParams, SearchStrategy};
use crate::filtering::BitsetView;
use crate::heap::{heap_offer, Comparator, HeapArray};
use crate::range::{RangeSearchPartialResult, RangeSearchResult};

/// Validated scan inputs.
#[derive(Debug, Clone, Copy)]
pub(super) struct Scan<'a> {
    pub queries: &'a [u8],
    pub db: &'a [u8],
    pub code_size: usize,
    pub nq: usize,
    pub nb: usize,
    pub filter: BitsetView<'a>,
}

impl Scan<'_> {
    #[inline]
    fn query(&self, i: usize) -> &[u8] {
        &self.queries[i * self.code_size..(i + 1) * self.code_size]
    }

    #[inline]
    fn code(&self, j: usize) -> &[u8] {
        &self.db[j * self.code_size..(j + 1) * self.code_size]
    }

    fn computers<M: BinaryComputer>(&self) -> Vec<M> {
        (0..self.nq)
            .map(|i| M::new(self.query(i), self.code_size))
            .collect()
    }

    /// `(j0, j1)` of each worker's database chunk.
    fn chunks(&self) -> Vec<(usize, usize)> {
        let nt = rayon::current_num_threads().max(1);
        let chunk = self.nb.div_ceil(nt).max(1);
        (0..self.nb)
            .step_by(chunk)
            .map(|j0| (j0, (j0 + chunk).min(self.nb)))
            .collect()
    }

    fn tile(&self, params: &BinarySearchParams) -> usize {
        (params.l3_size / self.code_size).max(1)
    }
}

/// Distances that range search reports as `f32`.
pub(super) trait AsF32: Copy {
    fn as_f32(self) -> f32;
}

impl AsF32 for i32 {
    #[inline]
    fn as_f32(self) -> f32 {
        self as f32
    }
}

impl AsF32 for f32 {
    #[inline]
    fn as_f32(self) -> f32 {
        self
    }
}

fn heap_query_major(
    params: &BinarySearchParams,
    scan: &Scan<'_>,
    k: usize,
    value_size: usize,
) -> bool {
    match params.strategy {
        SearchStrategy::QueryMajor => true,
        SearchStrategy::DatabaseMajor => false,
        SearchStrategy::Auto => {
            let nt = rayon::current_num_threads();
            (scan.code_size + k * (value_size + 8)) * scan.nq * nt <= params.l3_size
                && scan.nq < (scan.nb >> 11) + nt / 3
        }
    }
}

/// Top-k under a heap comparator.
pub(super) fn knn_hc<M, C>(
    params: &BinarySearchParams,
    scan: &Scan<'_>,
    k: usize,
) -> (Vec<C::T>, Vec<i64>)
where
    M: BinaryComputer,
    C: Comparator<T = M::Output>,
{
    if k == 0 || scan.nq == 0 {
        return (Vec::new(), Vec::new());
    }
    let query_major = heap_query_major(params, scan, k, std::mem::size_of::<C::T>());
    log::debug!(
        "binary knn: nq={} nb={} k={} code_size={} query_major={}",
        scan.nq,
        scan.nb,
        k,
        scan.code_size,
        query_major
    );

    let mut ha = if query_major {
        let computers = scan.computers::<M>();
        let partials: Vec<HeapArray<C>> = scan
            .chunks()
            .into_par_iter()
            .map(|(j0, j1)| {
                let mut ha = HeapArray::<C>::new(scan.nq, k);
                for j in j0..j1 {
                    if scan.filter.test(j) {
                        continue;
                    }
                    let code = scan.code(j);
                    for (i, hc) in computers.iter().enumerate() {
                        let (val, ids) = ha.heap_mut(i);
                        heap_offer::<C>(val, ids, hc.compute(code), j as i64);
                    }
                }
                ha
            })
            .collect();
        let mut parts = partials.into_iter();
        let mut merged = parts
            .next()
            .unwrap_or_else(|| HeapArray::<C>::new(scan.nq, k));
        for part in parts {
            for i in 0..scan.nq {
                let (val, ids) = merged.heap_mut(i);
                for (&v, &id) in part.vals(i).iter().zip(part.labels(i)) {
                    if id >= 0 {
                        heap_offer::<C>(val, ids, v, id);
                    }
                }
            }
        }
        merged
    } else {
        let tile = scan.tile(params);
        let mut ha = HeapArray::<C>::new(scan.nq, k);
        for j0 in (0..scan.nb).step_by(tile) {
            let j1 = (j0 + tile).min(scan.nb);
            ha.val
                .par_chunks_mut(k)
                .zip(ha.ids.par_chunks_mut(k))
                .enumerate()
                .for_each(|(i, (val, ids))| {
                    let hc = M::new(scan.query(i), scan.code_size);
                    for j in j0..j1 {
                        if !scan.filter.test(j) {
                            heap_offer::<C>(val, ids, hc.compute(scan.code(j)), j as i64);
                        }
                    }
                });
        }
        ha
    };
    ha.reorder();
    ha.into_parts()
}

/// First `k` matching ids per query, in database order.
pub(super) fn knn_mc<M>(params: &BinarySearchParams, scan: &Scan<'_>, k: usize) -> (Vec<f32>, Vec<i64>)
where
    M: BinaryComputer<Output = bool>,
{
    let mut labels = vec![-1i64; scan.nq * k];
    if k == 0 || scan.nq == 0 {
        return (Vec::new(), labels);
    }
    let query_major = match params.strategy {
        SearchStrategy::QueryMajor => true,
        SearchStrategy::DatabaseMajor => false,
        SearchStrategy::Auto => scan.nq < scan.nb,
    };
    log::debug!(
        "binary match: nq={} nb={} k={} query_major={}",
        scan.nq,
        scan.nb,
        k,
        query_major
    );

    let mut found = vec![0usize; scan.nq];
    if query_major {
        let computers = scan.computers::<M>();
        let partials: Vec<Vec<Vec<i64>>> = scan
            .chunks()
            .into_par_iter()
            .map(|(j0, j1)| {
                let mut hits: Vec<Vec<i64>> = vec![Vec::new(); scan.nq];
                for j in j0..j1 {
                    if scan.filter.test(j) {
                        continue;
                    }
                    let code = scan.code(j);
                    for (hc, h) in computers.iter().zip(hits.iter_mut()) {
                        if h.len() < k && hc.compute(code) {
                            h.push(j as i64);
                        }
                    }
                }
                hits
            })
            .collect();
        for part in partials {
            for (i, hits) in part.into_iter().enumerate() {
                let row = &mut labels[i * k..(i + 1) * k];
                let n = &mut found[i];
                let take = hits.len().min(k - *n);
                row[*n..*n + take].copy_from_slice(&hits[..take]);
                *n += take;
            }
        }
    } else {
        let tile = scan.tile(params);
        for j0 in (0..scan.nb).step_by(tile) {
            let j1 = (j0 + tile).min(scan.nb);
            labels
                .par_chunks_mut(k)
                .zip(found.par_iter_mut())
                .enumerate()
                .for_each(|(i, (row, n))| {
                    if *n == k {
                        return;
                    }
                    let hc = M::new(scan.query(i), scan.code_size);
                    for j in j0..j1 {
                        if !scan.filter.test(j) && hc.compute(scan.code(j)) {
                            row[*n] = j as i64;
                            *n += 1;
                            if *n == k {
                                break;
                            }
                        }
                    }
                });
        }
    }

    let mut distances = vec![0.0f32; scan.nq * k];
    for (i, &n) in found.iter().enumerate() {
        distances[i * k + n..(i + 1) * k].fill(f32::INFINITY);
    }
    (distances, labels)
}

/// All entries with distance strictly below `radius`.
pub(super) fn range<M>(scan: &Scan<'_>, radius: f32) -> RangeSearchResult
where
    M: BinaryComputer,
    M::Output: AsF32,
{
    let partials: Vec<RangeSearchPartialResult> = (0..scan.nq)
        .into_par_iter()
        .fold(RangeSearchPartialResult::default, |mut pres, i| {
            let mc = M::new(scan.query(i), scan.code_size);
            let qres = pres.new_result(i);
            for j in 0..scan.nb {
                if scan.filter.test(j) {
                    continue;
                }
                let dis = mc.compute(scan.code(j)).as_f32();
                if dis < radius {
                    qres.add(dis, j as i64);
                }
            }
            pres
        })
        .collect();
    RangeSearchResult::merge(scan.nq, partials)
}
