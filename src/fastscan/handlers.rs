//! Result collectors fed by the block kernel.
//!
//! A handler receives, for each processed block and query, the 32 accumulated `u16`
//! distances of that block. Blocks arrive in increasing order but may be skipped.
//! Entries at or past `ntotal` are padding and never reported.

use std::cmp::Ordering;

use super::kernel::BlockDistances;
use super::BLOCK_SIZE;
use crate::filtering::BitsetView;
use crate::heap::{heap_heapify, heap_offer, heap_reorder, Comparator};
use crate::range::{RangeQueryResult, RangeSearchPartialResult, RangeSearchResult};

/// Consumer of block distances.
pub trait ResultHandler {
    /// Position of the next `handle` calls: query offset `i0`, database offset `j0`.
    fn set_block_origin(&mut self, i0: usize, j0: usize);

    /// Distances of entries `j0 + 32 b .. j0 + 32 b + 16` (`d0`) and the next 16 (`d1`)
    /// for query `i0 + q`.
    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]);

    /// Exclusion filter; blocks whose ids are all excluded are skipped.
    fn filter(&self) -> BitsetView<'_> {
        BitsetView::empty()
    }

    /// Number of real database entries.
    fn ntotal(&self) -> usize {
        usize::MAX
    }

    /// Label of entry `j` of sub-block `b` at the current origin.
    fn adjust_id(&self, b: usize, j: usize) -> i64;
}

/// State shared by the top-k and range handlers.
#[derive(Debug, Clone)]
struct Origin<'a> {
    i0: usize,
    j0: usize,
    ntotal: usize,
    id_map: Option<&'a [i64]>,
    bitset: BitsetView<'a>,
}

impl<'a> Origin<'a> {
    fn new(ntotal: usize) -> Self {
        Self {
            i0: 0,
            j0: 0,
            ntotal,
            id_map: None,
            bitset: BitsetView::empty(),
        }
    }

    #[inline]
    fn position(&self, b: usize, j: usize) -> usize {
        self.j0 + BLOCK_SIZE * b + j
    }

    #[inline]
    fn adjust_id(&self, b: usize, j: usize) -> i64 {
        let pos = self.position(b, j);
        match self.id_map {
            Some(map) => map[pos],
            None => pos as i64,
        }
    }

    #[inline]
    fn excluded(&self, id: i64) -> bool {
        !self.bitset.is_empty() && id >= 0 && self.bitset.test(id as usize)
    }

    /// Bit `j` set when entry `j` of the 32 beats `thr` and is a real entry.
    fn candidates_mask<C: Comparator<T = u16>>(
        &self,
        thr: u16,
        b: usize,
        d0: &[u16; 16],
        d1: &[u16; 16],
    ) -> u32 {
        let mut mask = 0u32;
        for (j, &v) in d0.iter().chain(d1).enumerate() {
            if C::cmp(thr, v) {
                mask |= 1 << j;
            }
        }
        let start = self.position(b, 0);
        if start + BLOCK_SIZE > self.ntotal {
            if start >= self.ntotal {
                return 0;
            }
            mask &= (1u32 << (self.ntotal - start)) - 1;
        }
        mask
    }
}

/// Distances `(a, b)` normalizer of query `q`: float = `b + u16 / a`.
#[inline]
fn normalizer(normalizers: Option<&[f32]>, q: usize) -> (f32, f32) {
    normalizers.map_or((1.0, 0.0), |n| (1.0 / n[2 * q], n[2 * q + 1]))
}

/// Float value of an empty slot for comparator `C`.
#[inline]
fn float_neutral<C: Comparator>() -> f32 {
    if C::keeps_smallest() {
        f32::MAX
    } else {
        f32::MIN
    }
}

#[inline]
fn block_values(d0: &[u16; 16], d1: &[u16; 16]) -> [u16; 32] {
    std::array::from_fn(|j| if j < 16 { d0[j] } else { d1[j - 16] })
}

macro_rules! origin_accessors {
    ($lt:lifetime) => {
        /// Translate database positions through `id_map`.
        #[must_use]
        pub fn with_id_map(mut self, id_map: &$lt [i64]) -> Self {
            self.origin.id_map = Some(id_map);
            self
        }

        /// Skip excluded ids.
        #[must_use]
        pub fn with_bitset(mut self, bitset: BitsetView<$lt>) -> Self {
            self.origin.bitset = bitset;
            self
        }
    };
}

macro_rules! origin_handler_impl {
    () => {
        fn set_block_origin(&mut self, i0: usize, j0: usize) {
            self.origin.i0 = i0;
            self.origin.j0 = j0;
        }

        fn filter(&self) -> BitsetView<'_> {
            self.origin.bitset
        }

        fn ntotal(&self) -> usize {
            self.origin.ntotal
        }

        fn adjust_id(&self, b: usize, j: usize) -> i64 {
            self.origin.adjust_id(b, j)
        }
    };
}

/// Best single result per query.
#[derive(Debug, Clone)]
pub struct SingleResultHandler<'a, C: Comparator<T = u16>> {
    origin: Origin<'a>,
    results: Vec<(u16, i64)>,
    _cmp: C,
}

impl<'a, C: Comparator<T = u16>> SingleResultHandler<'a, C> {
    /// Handler for `nq` queries over `ntotal` entries.
    #[must_use]
    pub fn new(nq: usize, ntotal: usize) -> Self {
        Self {
            origin: Origin::new(ntotal),
            results: vec![(C::neutral(), -1); nq],
            _cmp: C::default(),
        }
    }

    origin_accessors!('a);

    /// Distances and labels, `nq` each.
    pub fn to_flat_arrays(
        &self,
        distances: &mut [f32],
        labels: &mut [i64],
        normalizers: Option<&[f32]>,
    ) {
        for (q, &(v, id)) in self.results.iter().enumerate() {
            let (one_a, b) = normalizer(normalizers, q);
            labels[q] = id;
            distances[q] = if id < 0 {
                float_neutral::<C>()
            } else {
                b + f32::from(v) * one_a
            };
        }
    }
}

impl<C: Comparator<T = u16>> ResultHandler for SingleResultHandler<'_, C> {
    origin_handler_impl!();

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        let q = q + self.origin.i0;
        let (mut val, mut id) = self.results[q];
        let mut mask = self.origin.candidates_mask::<C>(val, b, d0, d1);
        if mask == 0 {
            return;
        }
        let dis = block_values(d0, d1);
        while mask != 0 {
            let j = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            if C::cmp(val, dis[j]) {
                let idx = self.origin.adjust_id(b, j);
                if !self.origin.excluded(idx) {
                    val = dis[j];
                    id = idx;
                }
            }
        }
        self.results[q] = (val, id);
    }
}

/// Top-k per query in a bounded heap.
#[derive(Debug, Clone)]
pub struct HeapHandler<'a, C: Comparator<T = u16>> {
    origin: Origin<'a>,
    k: usize,
    vals: Vec<u16>,
    ids: Vec<i64>,
    _cmp: C,
}

impl<'a, C: Comparator<T = u16>> HeapHandler<'a, C> {
    /// Handler keeping `k` results for each of `nq` queries over `ntotal` entries.
    #[must_use]
    pub fn new(nq: usize, ntotal: usize, k: usize) -> Self {
        let mut vals = vec![C::neutral(); nq * k];
        let mut ids = vec![-1i64; nq * k];
        if k > 0 {
            for (v, i) in vals.chunks_exact_mut(k).zip(ids.chunks_exact_mut(k)) {
                heap_heapify::<C>(k, v, i);
            }
        }
        Self {
            origin: Origin::new(ntotal),
            k,
            vals,
            ids,
            _cmp: C::default(),
        }
    }

    origin_accessors!('a);

    /// Sorted distances and labels, `nq * k` each.
    pub fn to_flat_arrays(
        &mut self,
        distances: &mut [f32],
        labels: &mut [i64],
        normalizers: Option<&[f32]>,
    ) {
        let k = self.k;
        if k == 0 {
            return;
        }
        for (q, (v, i)) in self
            .vals
            .chunks_exact_mut(k)
            .zip(self.ids.chunks_exact_mut(k))
            .enumerate()
        {
            heap_reorder::<C>(k, v, i);
            let (one_a, b) = normalizer(normalizers, q);
            for j in 0..k {
                labels[q * k + j] = i[j];
                distances[q * k + j] = if i[j] < 0 {
                    float_neutral::<C>()
                } else {
                    b + f32::from(v[j]) * one_a
                };
            }
        }
    }
}

impl<C: Comparator<T = u16>> ResultHandler for HeapHandler<'_, C> {
    origin_handler_impl!();

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        let k = self.k;
        if k == 0 {
            return;
        }
        let q = q + self.origin.i0;
        let vals = &mut self.vals[q * k..(q + 1) * k];
        let ids = &mut self.ids[q * k..(q + 1) * k];
        let mut mask = self.origin.candidates_mask::<C>(vals[0], b, d0, d1);
        if mask == 0 {
            return;
        }
        let dis = block_values(d0, d1);
        while mask != 0 {
            let j = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            let idx = self.origin.adjust_id(b, j);
            if !self.origin.excluded(idx) {
                heap_offer::<C>(vals, ids, dis[j], idx);
            }
        }
    }
}

/// Unsorted buffer of candidates that is cut back to the best `n` whenever it fills up.
#[derive(Debug, Clone)]
struct Reservoir {
    vals: Vec<u16>,
    ids: Vec<i64>,
    n: usize,
    capacity: usize,
    threshold: u16,
}

impl Reservoir {
    fn new<C: Comparator<T = u16>>(n: usize, capacity: usize) -> Self {
        Self {
            vals: Vec::with_capacity(capacity),
            ids: Vec::with_capacity(capacity),
            n,
            capacity,
            threshold: C::neutral(),
        }
    }

    fn add<C: Comparator<T = u16>>(&mut self, val: u16, id: i64) {
        if C::cmp(self.threshold, val) {
            if self.vals.len() == self.capacity {
                self.shrink::<C>();
            }
            self.vals.push(val);
            self.ids.push(id);
        }
    }

    /// Keep the best `n` and raise the threshold to the worst of them.
    fn shrink<C: Comparator<T = u16>>(&mut self) {
        if self.vals.len() <= self.n {
            return;
        }
        let mut order: Vec<usize> = (0..self.vals.len()).collect();
        let better = |&a: &usize, &b: &usize| -> Ordering {
            if C::cmp2(self.vals[b], self.vals[a], self.ids[b], self.ids[a]) {
                Ordering::Less
            } else if C::cmp2(self.vals[a], self.vals[b], self.ids[a], self.ids[b]) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        };
        order.select_nth_unstable_by(self.n - 1, better);
        order.truncate(self.n);
        let vals: Vec<u16> = order.iter().map(|&i| self.vals[i]).collect();
        let ids: Vec<i64> = order.iter().map(|&i| self.ids[i]).collect();
        self.threshold = vals
            .iter()
            .copied()
            .reduce(|a, b| if C::cmp(a, b) { a } else { b })
            .unwrap_or(C::neutral());
        self.vals = vals;
        self.ids = ids;
    }
}

/// Top-k per query through a reservoir of capacity `2k`; cheaper than a heap when many
/// candidates beat the threshold.
#[derive(Debug, Clone)]
pub struct ReservoirHandler<'a, C: Comparator<T = u16>> {
    origin: Origin<'a>,
    k: usize,
    reservoirs: Vec<Reservoir>,
    _cmp: C,
}

impl<'a, C: Comparator<T = u16>> ReservoirHandler<'a, C> {
    /// Handler keeping `k` results for each of `nq` queries, with a buffer of `capacity`
    /// (at least `k + 1`, rounded up to a multiple of 16).
    #[must_use]
    pub fn new(nq: usize, ntotal: usize, k: usize, capacity: usize) -> Self {
        let capacity = capacity.max(k + 1).div_ceil(16) * 16;
        Self {
            origin: Origin::new(ntotal),
            k,
            reservoirs: (0..nq).map(|_| Reservoir::new::<C>(k, capacity)).collect(),
            _cmp: C::default(),
        }
    }

    /// The usual configuration: capacity `2k`.
    #[must_use]
    pub fn with_k(nq: usize, ntotal: usize, k: usize) -> Self {
        Self::new(nq, ntotal, k, 2 * k)
    }

    origin_accessors!('a);

    /// Sorted distances and labels, `nq * k` each; missing results are padded.
    pub fn to_flat_arrays(
        &mut self,
        distances: &mut [f32],
        labels: &mut [i64],
        normalizers: Option<&[f32]>,
    ) {
        let k = self.k;
        if k == 0 {
            return;
        }
        for (q, res) in self.reservoirs.iter_mut().enumerate() {
            if res.vals.len() > k {
                res.shrink::<C>();
            }
            let mut perm: Vec<usize> = (0..res.vals.len()).collect();
            perm.sort_by(|&a, &b| {
                if C::cmp2(res.vals[b], res.vals[a], res.ids[b], res.ids[a]) {
                    Ordering::Less
                } else if C::cmp2(res.vals[a], res.vals[b], res.ids[a], res.ids[b]) {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            });
            let (one_a, b) = normalizer(normalizers, q);
            for j in 0..k {
                let (dis, label) = match perm.get(j) {
                    Some(&p) => (b + f32::from(res.vals[p]) * one_a, res.ids[p]),
                    None => (float_neutral::<C>(), -1),
                };
                distances[q * k + j] = dis;
                labels[q * k + j] = label;
            }
        }
    }
}

impl<C: Comparator<T = u16>> ResultHandler for ReservoirHandler<'_, C> {
    origin_handler_impl!();

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        if self.k == 0 {
            return;
        }
        let q = q + self.origin.i0;
        let thr = self.reservoirs[q].threshold;
        let mut mask = self.origin.candidates_mask::<C>(thr, b, d0, d1);
        if mask == 0 {
            return;
        }
        let dis = block_values(d0, d1);
        while mask != 0 {
            let j = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            let idx = self.origin.adjust_id(b, j);
            if !self.origin.excluded(idx) {
                self.reservoirs[q].add::<C>(dis[j], idx);
            }
        }
    }
}

/// All entries whose normalized distance beats a float radius.
#[derive(Debug, Clone)]
pub struct RangeHandler<'a, C: Comparator<T = f32>> {
    origin: Origin<'a>,
    radius: f32,
    normalizers: Option<&'a [f32]>,
    results: Vec<RangeQueryResult>,
    _cmp: C,
}

impl<'a, C: Comparator<T = f32>> RangeHandler<'a, C> {
    /// Handler for `nq` queries; with [`crate::heap::CMax`] an entry is kept when its
    /// distance is strictly below `radius`.
    #[must_use]
    pub fn new(nq: usize, ntotal: usize, radius: f32) -> Self {
        Self {
            origin: Origin::new(ntotal),
            radius,
            normalizers: None,
            results: (0..nq)
                .map(|qno| RangeQueryResult {
                    qno,
                    ..Default::default()
                })
                .collect(),
            _cmp: C::default(),
        }
    }

    origin_accessors!('a);

    /// Compare `b + u16 / a` with the radius instead of the raw `u16`.
    #[must_use]
    pub fn with_normalizers(mut self, normalizers: &'a [f32]) -> Self {
        self.normalizers = Some(normalizers);
        self
    }

    /// Collect the matches, in database order per query.
    #[must_use]
    pub fn into_result(self) -> RangeSearchResult {
        let nq = self.results.len();
        RangeSearchResult::merge(
            nq,
            vec![RangeSearchPartialResult {
                queries: self.results,
            }],
        )
    }
}

impl<C: Comparator<T = f32>> ResultHandler for RangeHandler<'_, C> {
    origin_handler_impl!();

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        let q = q + self.origin.i0;
        let (one_a, bias) = normalizer(self.normalizers, q);
        let start = self.origin.position(b, 0);
        let n = self.origin.ntotal.saturating_sub(start).min(BLOCK_SIZE);
        let dis = block_values(d0, d1);
        for (j, &v) in dis.iter().enumerate().take(n) {
            let d = bias + f32::from(v) * one_a;
            if C::cmp(self.radius, d) {
                let idx = self.origin.adjust_id(b, j);
                if !self.origin.excluded(idx) {
                    self.results[q].add(d, idx);
                }
            }
        }
    }
}

/// Raw `u16` distances written to an `nq × ld` matrix.
#[derive(Debug)]
pub struct StoreResultHandler<'a> {
    data: &'a mut [u16],
    ld: usize,
    i0: usize,
    j0: usize,
}

impl<'a> StoreResultHandler<'a> {
    /// Store into `data`, rows of `ld` entries.
    #[must_use]
    pub fn new(data: &'a mut [u16], ld: usize) -> Self {
        Self {
            data,
            ld,
            i0: 0,
            j0: 0,
        }
    }
}

impl ResultHandler for StoreResultHandler<'_> {
    fn set_block_origin(&mut self, i0: usize, j0: usize) {
        self.i0 = i0;
        self.j0 = j0;
    }

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        let ofs = (q + self.i0) * self.ld + self.j0 + b * BLOCK_SIZE;
        self.data[ofs..ofs + 16].copy_from_slice(d0);
        self.data[ofs + 16..ofs + 32].copy_from_slice(d1);
    }

    fn adjust_id(&self, b: usize, j: usize) -> i64 {
        (self.j0 + BLOCK_SIZE * b + j) as i64
    }
}

/// Staging for one block of an `NQ`-query batch, flushed to another handler in query order.
#[derive(Debug, Clone, Copy)]
pub struct FixedStorageHandler<const NQ: usize> {
    dis: [BlockDistances; NQ],
    i0: usize,
}

impl<const NQ: usize> Default for FixedStorageHandler<NQ> {
    fn default() -> Self {
        Self {
            dis: [[[0u16; 16]; 2]; NQ],
            i0: 0,
        }
    }
}

impl<const NQ: usize> FixedStorageHandler<NQ> {
    /// Replay the staged block into `other`, whose origin is already set.
    pub fn to_other_handler<H: ResultHandler + ?Sized>(&self, other: &mut H) {
        for (q, [d0, d1]) in self.dis.iter().enumerate() {
            other.handle(q, 0, d0, d1);
        }
    }
}

impl<const NQ: usize> ResultHandler for FixedStorageHandler<NQ> {
    fn set_block_origin(&mut self, i0: usize, j0: usize) {
        debug_assert_eq!(j0, 0);
        self.i0 = i0;
    }

    fn handle(&mut self, q: usize, b: usize, d0: &[u16; 16], d1: &[u16; 16]) {
        debug_assert_eq!(b, 0);
        self.dis[q + self.i0] = [*d0, *d1];
    }

    fn adjust_id(&self, b: usize, j: usize) -> i64 {
        (BLOCK_SIZE * b + j) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::Bitset;
    use crate::heap::{CMax, CMin};

    fn block(base: u16) -> ([u16; 16], [u16; 16]) {
        (
            std::array::from_fn(|j| base + j as u16),
            std::array::from_fn(|j| base + 16 + j as u16),
        )
    }

    #[test]
    fn heap_keeps_smallest_and_ignores_padding() {
        let mut h = HeapHandler::<CMax<u16>>::new(1, 40, 3);
        let (d0, d1) = block(100);
        h.set_block_origin(0, 0);
        h.handle(0, 0, &d0, &d1);
        // second block: all smaller, but only 8 real entries
        let (e0, e1) = block(0);
        h.set_block_origin(0, 32);
        h.handle(0, 0, &e0, &e1);
        let mut dis = [0.0f32; 3];
        let mut lab = [0i64; 3];
        h.to_flat_arrays(&mut dis, &mut lab, None);
        assert_eq!(lab, [32, 33, 34]);
        assert_eq!(dis, [0.0, 1.0, 2.0]);
    }

    #[test]
    fn min_heap_keeps_largest() {
        let mut h = HeapHandler::<CMin<u16>>::new(1, 32, 2);
        let (d0, d1) = block(0);
        h.set_block_origin(0, 0);
        h.handle(0, 0, &d0, &d1);
        let mut dis = [0.0f32; 2];
        let mut lab = [0i64; 2];
        h.to_flat_arrays(&mut dis, &mut lab, None);
        assert_eq!(lab, [31, 30]);
    }

    #[test]
    fn unfilled_slots_are_padded() {
        let mut h = HeapHandler::<CMax<u16>>::new(1, 2, 4);
        let (d0, d1) = block(5);
        h.set_block_origin(0, 0);
        h.handle(0, 0, &d0, &d1);
        let mut dis = [0.0f32; 4];
        let mut lab = [0i64; 4];
        h.to_flat_arrays(&mut dis, &mut lab, Some(&[2.0, 1.0]));
        assert_eq!(lab, [0, 1, -1, -1]);
        assert_eq!(dis[..2], [3.5, 4.0]);
        assert_eq!(dis[2], f32::MAX);
    }

    #[test]
    fn bitset_and_id_map_apply() {
        let map: Vec<i64> = (0..32).map(|i| 1000 + i).collect();
        let mut bits = Bitset::new(1001);
        bits.set(1000);
        let view = bits.view();
        let mut h = SingleResultHandler::<CMax<u16>>::new(1, 32)
            .with_id_map(&map)
            .with_bitset(view);
        let (d0, d1) = block(0);
        h.set_block_origin(0, 0);
        h.handle(0, 0, &d0, &d1);
        let mut dis = [0.0f32];
        let mut lab = [0i64];
        h.to_flat_arrays(&mut dis, &mut lab, None);
        assert_eq!(lab, [1001]);
        assert_eq!(dis, [1.0]);
    }

    #[test]
    fn reservoir_agrees_with_heap() {
        let k = 5;
        let mut heap = HeapHandler::<CMax<u16>>::new(1, 320, k);
        let mut res = ReservoirHandler::<CMax<u16>>::with_k(1, 320, k);
        for blk in 0..10u16 {
            let d0: [u16; 16] = std::array::from_fn(|j| (j as u16 * 37 + blk * 11) % 50);
            let d1: [u16; 16] = std::array::from_fn(|j| (j as u16 * 13 + blk * 7) % 50);
            heap.set_block_origin(0, blk as usize * 32);
            heap.handle(0, 0, &d0, &d1);
            res.set_block_origin(0, blk as usize * 32);
            res.handle(0, 0, &d0, &d1);
        }
        let (mut a, mut la) = ([0.0f32; 5], [0i64; 5]);
        let (mut b, mut lb) = ([0.0f32; 5], [0i64; 5]);
        heap.to_flat_arrays(&mut a, &mut la, None);
        res.to_flat_arrays(&mut b, &mut lb, None);
        assert_eq!(a, b);
    }

    #[test]
    fn range_is_strict() {
        let mut h = RangeHandler::<CMax<f32>>::new(1, 32, 3.0);
        let (d0, d1) = block(0);
        h.set_block_origin(0, 0);
        h.handle(0, 0, &d0, &d1);
        let r = h.into_result();
        assert_eq!(r.query(0).0, &[0, 1, 2]);
    }

    #[test]
    fn fixed_storage_replays_in_query_order() {
        let mut stage = FixedStorageHandler::<3>::default();
        let (d0, d1) = block(7);
        stage.set_block_origin(1, 0);
        stage.handle(1, 0, &d0, &d1);
        let mut out = vec![0u16; 3 * 32];
        let mut store = StoreResultHandler::new(&mut out, 32);
        store.set_block_origin(0, 0);
        stage.to_other_handler(&mut store);
        assert_eq!(out[2 * 32], 7);
        assert_eq!(out[0], 0);
    }
}
