//! 4-bit product-quantization fast-scan.
//!
//! # Asymmetric distance computation in registers
//!
//! With 16 centroids per sub-quantizer, a query's lookup table row fits in one 128-bit
//! lane, so a byte shuffle performs 16 (32 with two lanes) table lookups at once:
//!
//! ```text
//! distance(query, code) = Σ_sq LUT[sq][code[sq]]
//! ```
//!
//! Codes are stored in blocks of 32 database entries ([`pack_codes`]) and tables are
//! quantized to bytes ([`quantize_lut`]) and interleaved per query batch ([`pack_lut`]).
//! Per block, the kernel produces 32 `u16` sums per query and hands them to a
//! [`ResultHandler`].
//!
//! Queries are processed in groups described by a *query batch shape* `qbs`: one hex
//! digit per group, lowest digit first, e.g. `0x233` is three groups of 3, 3 and 2
//! queries. Common shapes have a specialized path ([`accumulate_qbs`]).
//!
//! ```
//! use quantscan::fastscan::{accumulate_qbs, pack_codes, pack_lut, HeapHandler};
//! use quantscan::heap::CMax;
//!
//! // 40 entries, 2 sub-quantizers; entry i has codes (i % 16, 0)
//! let codes: Vec<u8> = (0..40u8).flat_map(|i| [i % 16, 0]).collect();
//! let packed = pack_codes(&codes, 40, 2)?;
//! // one query, table value = code
//! let lut: Vec<u8> = (0..2).flat_map(|_| 0..16u8).collect();
//! let lut = pack_lut(0x1, 2, &lut)?;
//!
//! let mut handler = HeapHandler::<CMax<u16>>::new(1, 40, 2);
//! accumulate_qbs(0x1, 64, 2, &packed, &lut, &mut handler)?;
//! let (mut dis, mut labels) = ([0.0f32; 2], [0i64; 2]);
//! handler.to_flat_arrays(&mut dis, &mut labels, None);
//! assert_eq!(labels, [0, 16]);
//! # Ok::<(), quantscan::QuantError>(())
//! ```

mod handlers;
mod kernel;
mod pack;

pub use handlers::{
    FixedStorageHandler, HeapHandler, RangeHandler, ReservoirHandler, ResultHandler,
    SingleResultHandler, StoreResultHandler,
};
pub use kernel::{BlockDistances, Kernel};
pub use pack::{
    get_packed_element, pack_codes, pack_lut, padded_nsq, padded_ntotal, quantize_lut,
};

use std::fmt;
use std::ops::{Deref, DerefMut};

use smallvec::SmallVec;

use crate::error::{QuantError, Result};

/// Database entries per kernel block.
pub const BLOCK_SIZE: usize = 32;

/// Byte alignment required of code and LUT buffers.
pub const ALIGNMENT: usize = 32;

#[derive(Clone, Copy)]
#[repr(C, align(32))]
struct Chunk([u8; ALIGNMENT]);

/// Byte buffer whose start is 32-byte aligned.
#[derive(Clone, Default)]
pub struct AlignedBytes {
    chunks: Vec<Chunk>,
    len: usize,
}

impl AlignedBytes {
    /// `len` zero bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            chunks: vec![Chunk([0; ALIGNMENT]); len.div_ceil(ALIGNMENT)],
            len,
        }
    }

    /// Aligned copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut out = Self::zeroed(data.len());
        out.copy_from_slice(data);
        out
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `chunks` owns at least `len` initialized bytes and `Chunk` has no padding.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast::<u8>(), self.len) }
    }
}

impl DerefMut for AlignedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}

impl PartialEq for AlignedBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

/// Group sizes of a query batch shape, lowest digit first.
pub(crate) fn qbs_groups(qbs: usize) -> Result<SmallVec<[usize; 8]>> {
    if qbs == 0 {
        return Err(QuantError::Configuration(
            "query batch shape must contain at least one group".into(),
        ));
    }
    let mut groups = SmallVec::new();
    let mut qi = qbs;
    while qi != 0 {
        let nq = qi & 15;
        if nq == 0 {
            return Err(QuantError::Configuration(format!(
                "query batch shape {qbs:#x} has an empty group"
            )));
        }
        groups.push(nq);
        qi >>= 4;
    }
    Ok(groups)
}

/// Total number of queries in a batch shape.
#[must_use]
pub fn qbs_to_nq(qbs: usize) -> usize {
    let mut qi = qbs;
    let mut n = 0;
    while qi != 0 {
        n += qi & 15;
        qi >>= 4;
    }
    n
}

/// Batch shape that runs fastest for `n` queries.
pub fn preferred_qbs(n: usize) -> Result<usize> {
    const MAP: [usize; 12] = [0, 1, 2, 3, 0x13, 0x23, 0x33, 0x223, 0x233, 0x333, 0x2233, 0x2333];
    if n <= 11 {
        Ok(MAP[n])
    } else if n <= 24 {
        // groups of 3, then the remainder
        let nbit = 4 * (n / 3);
        let mut qbs = 0x3333_3333usize & ((1usize << nbit) - 1);
        qbs |= (n % 3) << nbit;
        Ok(qbs)
    } else {
        Err(QuantError::Configuration(format!(
            "{n} queries is too many for one batch shape"
        )))
    }
}

#[inline]
fn is_aligned(buf: &[u8]) -> bool {
    buf.is_empty() || (buf.as_ptr() as usize) % ALIGNMENT == 0
}

fn check_inputs(
    kernel: Kernel,
    nq: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
) -> Result<()> {
    if !kernel.is_available() {
        return Err(QuantError::Configuration(format!(
            "{kernel:?} kernel is not supported on this CPU"
        )));
    }
    if nsq == 0 || nsq % 2 != 0 {
        return Err(QuantError::Alignment(format!(
            "number of sub-quantizers {nsq} must be even and positive"
        )));
    }
    if ntotal2 % BLOCK_SIZE != 0 {
        return Err(QuantError::Alignment(format!(
            "database size {ntotal2} is not a multiple of {BLOCK_SIZE}"
        )));
    }
    if codes.len() < ntotal2 * nsq / 2 {
        return Err(QuantError::Alignment(format!(
            "code buffer holds {} bytes, {} needed",
            codes.len(),
            ntotal2 * nsq / 2
        )));
    }
    if lut.len() < nq * nsq * 16 {
        return Err(QuantError::Alignment(format!(
            "LUT buffer holds {} bytes, {} needed",
            lut.len(),
            nq * nsq * 16
        )));
    }
    if !is_aligned(codes) || !is_aligned(lut) {
        return Err(QuantError::Alignment(format!(
            "code and LUT buffers must be {ALIGNMENT}-byte aligned"
        )));
    }
    Ok(())
}

/// Whether every real entry of the block at `j0` is excluded by the handler's filter.
fn block_excluded<H: ResultHandler + ?Sized>(res: &H, j0: usize) -> bool {
    let filter = res.filter();
    if filter.is_empty() {
        return false;
    }
    let n = res.ntotal().saturating_sub(j0).min(BLOCK_SIZE);
    (0..n).all(|j| {
        let id = res.adjust_id(0, j);
        id < 0 || filter.test(id as usize)
    })
}

#[inline]
fn kernel_block<const NQ: usize, H: ResultHandler + ?Sized>(
    kernel: Kernel,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) {
    let dis = kernel::accumulate_block::<NQ>(kernel, nsq, codes, lut);
    for (q, [d0, d1]) in dis.iter().enumerate() {
        res.handle(q, 0, d0, d1);
    }
}

fn kernel_block_dyn<H: ResultHandler + ?Sized>(
    kernel: Kernel,
    nq: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) -> Result<()> {
    match nq {
        1 => kernel_block::<1, H>(kernel, nsq, codes, lut, res),
        2 => kernel_block::<2, H>(kernel, nsq, codes, lut, res),
        3 => kernel_block::<3, H>(kernel, nsq, codes, lut, res),
        4 => kernel_block::<4, H>(kernel, nsq, codes, lut, res),
        _ => {
            return Err(QuantError::Configuration(format!(
                "no kernel for a group of {nq} queries"
            )))
        }
    }
    Ok(())
}

fn blocks(codes: &[u8], ntotal2: usize, nsq: usize) -> impl Iterator<Item = (usize, &[u8])> {
    let bytes = BLOCK_SIZE * nsq / 2;
    codes[..ntotal2 * nsq / 2]
        .chunks_exact(bytes)
        .enumerate()
        .map(|(blk, c)| (blk * BLOCK_SIZE, c))
}

/// Accumulate `nq` (1 to 4) queries over `ntotal2` entries.
pub fn accumulate<H: ResultHandler>(
    nq: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) -> Result<()> {
    accumulate_with(Kernel::detect(), nq, ntotal2, nsq, codes, lut, res)
}

/// [`accumulate`] with an explicit kernel.
pub fn accumulate_with<H: ResultHandler>(
    kernel: Kernel,
    nq: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) -> Result<()> {
    if !(1..=4).contains(&nq) {
        return Err(QuantError::Configuration(format!(
            "accumulate handles 1 to 4 queries, got {nq}"
        )));
    }
    check_inputs(kernel, nq, ntotal2, nsq, codes, lut)?;
    for (j0, block) in blocks(codes, ntotal2, nsq) {
        res.set_block_origin(0, j0);
        if block_excluded(res, j0) {
            continue;
        }
        kernel_block_dyn(kernel, nq, nsq, block, lut, res)?;
    }
    Ok(())
}

/// Raw `u16` distances of `nq` queries to all `ntotal2` entries, row-major.
pub fn accumulate_to_mem(
    nq: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
) -> Result<Vec<u16>> {
    accumulate_to_mem_with(Kernel::detect(), nq, ntotal2, nsq, codes, lut)
}

/// [`accumulate_to_mem`] with an explicit kernel.
pub fn accumulate_to_mem_with(
    kernel: Kernel,
    nq: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
) -> Result<Vec<u16>> {
    let mut out = vec![0u16; nq * ntotal2];
    let mut handler = StoreResultHandler::new(&mut out, ntotal2);
    accumulate_with(kernel, nq, ntotal2, nsq, codes, lut, &mut handler)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn accumulate_q_4step<
    const Q1: usize,
    const Q2: usize,
    const Q3: usize,
    const Q4: usize,
    const SQ: usize,
    H: ResultHandler,
>(
    kernel: Kernel,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut0: &[u8],
    res: &mut H,
) {
    let dim12 = nsq * 16;
    for (j0, block) in blocks(codes, ntotal2, nsq) {
        res.set_block_origin(0, j0);
        if block_excluded(res, j0) {
            continue;
        }
        let mut stage = FixedStorageHandler::<SQ>::default();
        let mut lut = lut0;
        kernel_block::<Q1, _>(kernel, nsq, block, lut, &mut stage);
        lut = &lut[Q1 * dim12..];
        if Q2 > 0 {
            stage.set_block_origin(Q1, 0);
            kernel_block::<Q2, _>(kernel, nsq, block, lut, &mut stage);
            lut = &lut[Q2 * dim12..];
        }
        if Q3 > 0 {
            stage.set_block_origin(Q1 + Q2, 0);
            kernel_block::<Q3, _>(kernel, nsq, block, lut, &mut stage);
            lut = &lut[Q3 * dim12..];
        }
        if Q4 > 0 {
            stage.set_block_origin(Q1 + Q2 + Q3, 0);
            kernel_block::<Q4, _>(kernel, nsq, block, lut, &mut stage);
        }
        stage.to_other_handler(res);
    }
}

/// The per-group loop used for shapes without a specialized path.
pub(crate) fn accumulate_qbs_generic<H: ResultHandler>(
    kernel: Kernel,
    groups: &[usize],
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut0: &[u8],
    res: &mut H,
) -> Result<()> {
    if let Some(&g) = groups.iter().find(|&&g| g > 4) {
        return Err(QuantError::Configuration(format!(
            "no kernel for a group of {g} queries"
        )));
    }
    let dim12 = nsq * 16;
    for (j0, block) in blocks(codes, ntotal2, nsq) {
        res.set_block_origin(0, j0);
        if block_excluded(res, j0) {
            continue;
        }
        let mut lut = lut0;
        let mut i0 = 0;
        for &g in groups {
            res.set_block_origin(i0, j0);
            kernel_block_dyn(kernel, g, nsq, block, lut, res)?;
            i0 += g;
            lut = &lut[g * dim12..];
        }
    }
    Ok(())
}

/// Accumulate all queries of batch shape `qbs`; `lut` comes from [`pack_lut`] with the
/// same shape.
pub fn accumulate_qbs<H: ResultHandler>(
    qbs: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) -> Result<()> {
    accumulate_qbs_with(Kernel::detect(), qbs, ntotal2, nsq, codes, lut, res)
}

/// [`accumulate_qbs`] with an explicit kernel.
pub fn accumulate_qbs_with<H: ResultHandler>(
    kernel: Kernel,
    qbs: usize,
    ntotal2: usize,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
    res: &mut H,
) -> Result<()> {
    let groups = qbs_groups(qbs)?;
    check_inputs(kernel, groups.iter().sum(), ntotal2, nsq, codes, lut)?;

    macro_rules! four_step {
        ($q1:literal, $q2:literal, $q3:literal, $q4:literal) => {
            accumulate_q_4step::<$q1, $q2, $q3, $q4, { $q1 + $q2 + $q3 + $q4 }, H>(
                kernel, ntotal2, nsq, codes, lut, res,
            )
        };
    }

    match qbs {
        0x3333 => four_step!(3, 3, 3, 3),
        0x2333 => four_step!(3, 3, 3, 2),
        0x2233 => four_step!(3, 3, 2, 2),
        0x333 => four_step!(3, 3, 3, 0),
        0x2223 => four_step!(3, 2, 2, 2),
        0x233 => four_step!(3, 3, 2, 0),
        0x1223 => four_step!(3, 2, 2, 1),
        0x223 => four_step!(3, 2, 2, 0),
        0x34 => four_step!(4, 3, 0, 0),
        0x133 => four_step!(3, 3, 1, 0),
        0x6 => four_step!(6, 0, 0, 0),
        0x33 => four_step!(3, 3, 0, 0),
        0x123 => four_step!(3, 2, 1, 0),
        0x222 => four_step!(2, 2, 2, 0),
        0x23 => four_step!(3, 2, 0, 0),
        0x5 => four_step!(5, 0, 0, 0),
        0x13 => four_step!(3, 1, 0, 0),
        0x22 => four_step!(2, 2, 0, 0),
        0x4 => four_step!(4, 0, 0, 0),
        0x3 => four_step!(3, 0, 0, 0),
        0x21 => four_step!(1, 2, 0, 0),
        0x2 => four_step!(2, 0, 0, 0),
        0x1 => four_step!(1, 0, 0, 0),
        _ => return accumulate_qbs_generic(kernel, &groups, ntotal2, nsq, codes, lut, res),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::Bitset;
    use crate::heap::CMax;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Counting {
        calls: usize,
        bitset: Bitset,
    }

    impl ResultHandler for Counting {
        fn set_block_origin(&mut self, _i0: usize, _j0: usize) {}

        fn handle(&mut self, _q: usize, _b: usize, _d0: &[u16; 16], _d1: &[u16; 16]) {
            self.calls += 1;
        }

        fn filter(&self) -> crate::filtering::BitsetView<'_> {
            self.bitset.view()
        }

        fn ntotal(&self) -> usize {
            64
        }

        fn adjust_id(&self, _b: usize, j: usize) -> i64 {
            j as i64
        }
    }

    fn random_setup(nq: usize, ntotal: usize, m: usize, seed: u64) -> (AlignedBytes, Vec<u8>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let codes: Vec<u8> = (0..ntotal * m).map(|_| rng.random_range(0..16)).collect();
        let lut: Vec<u8> = (0..nq * padded_nsq(m) * 16).map(|_| rng.random()).collect();
        (pack_codes(&codes, ntotal, m).unwrap(), lut)
    }

    #[test]
    fn preferred_shapes() {
        assert_eq!(preferred_qbs(5).unwrap(), 0x23);
        assert_eq!(preferred_qbs(13).unwrap(), 0x1_3333);
        assert_eq!(qbs_to_nq(preferred_qbs(20).unwrap()), 20);
        assert!(preferred_qbs(25).is_err());
        assert_eq!(qbs_to_nq(0x233), 8);
    }

    #[test]
    fn zero_lut_gives_zero_distances() {
        let codes = vec![7u8; 32 * 4];
        let packed = pack_codes(&codes, 32, 4).unwrap();
        let lut = AlignedBytes::zeroed(4 * 16);
        let out = accumulate_to_mem(1, 32, 4, &packed, &lut).unwrap();
        assert!(out.iter().all(|&d| d == 0));
    }

    #[test]
    fn matches_scalar_sum() {
        let (nq, ntotal, m) = (3, 70, 6);
        let mut rng = StdRng::seed_from_u64(1);
        let codes: Vec<u8> = (0..ntotal * m).map(|_| rng.random_range(0..16)).collect();
        let lut: Vec<u8> = (0..nq * m * 16).map(|_| rng.random_range(0..64)).collect();
        let packed = pack_codes(&codes, ntotal, m).unwrap();
        let plut = pack_lut(0x3, m, &lut).unwrap();
        let ntotal2 = padded_ntotal(ntotal);
        let out = accumulate_to_mem(nq, ntotal2, m, &packed, &plut).unwrap();
        for q in 0..nq {
            for i in 0..ntotal {
                let expect: u16 = (0..m)
                    .map(|sq| u16::from(lut[q * m * 16 + sq * 16 + usize::from(codes[i * m + sq])]))
                    .sum();
                assert_eq!(out[q * ntotal2 + i], expect);
            }
        }
    }

    #[test]
    fn dispatched_shapes_match_generic_loop() {
        let nsq = 8;
        let kernel = Kernel::detect();
        for qbs in [0x3333usize, 0x233, 0x34, 0x1223, 0x21, 0x1] {
            let nq = qbs_to_nq(qbs);
            let (packed, lut) = random_setup(nq, 96, nsq, qbs as u64);
            let plut = pack_lut(qbs, nsq, &lut).unwrap();

            let mut fast = vec![0u16; nq * 96];
            let mut h = StoreResultHandler::new(&mut fast, 96);
            accumulate_qbs_with(kernel, qbs, 96, nsq, &packed, &plut, &mut h).unwrap();

            let groups = qbs_groups(qbs).unwrap();
            let mut slow = vec![0u16; nq * 96];
            let mut h = StoreResultHandler::new(&mut slow, 96);
            accumulate_qbs_generic(kernel, &groups, 96, nsq, &packed, &plut, &mut h).unwrap();
            assert_eq!(fast, slow, "qbs {qbs:#x}");
        }
    }

    #[test]
    fn wide_groups_match_single_queries() {
        let nsq = 4;
        let (packed, lut) = random_setup(6, 64, nsq, 9);
        let plut = pack_lut(0x6, nsq, &lut).unwrap();
        let mut wide = vec![0u16; 6 * 64];
        accumulate_qbs(0x6, 64, nsq, &packed, &plut, &mut StoreResultHandler::new(&mut wide, 64))
            .unwrap();
        for (q, row) in wide.chunks_exact(64).enumerate() {
            let one = pack_lut(0x1, nsq, &lut[q * nsq * 16..(q + 1) * nsq * 16]).unwrap();
            assert_eq!(row, accumulate_to_mem(1, 64, nsq, &packed, &one).unwrap());
        }
        assert!(matches!(
            accumulate_qbs_generic(Kernel::Portable, &[6], 64, nsq, &packed, &plut, &mut StoreResultHandler::new(&mut wide, 64)),
            Err(QuantError::Configuration(_))
        ));
    }

    #[test]
    fn fully_excluded_blocks_are_skipped() {
        let (packed, lut) = random_setup(2, 64, 4, 3);
        let plut = pack_lut(0x2, 4, &lut).unwrap();
        let mut bitset = Bitset::new(64);
        for i in 0..32 {
            bitset.set(i);
        }
        let mut h = Counting { calls: 0, bitset };
        accumulate_qbs(0x2, 64, 4, &packed, &plut, &mut h).unwrap();
        // adjust_id ignores j0, so both blocks look excluded
        assert_eq!(h.calls, 0);

        let mut h = HeapHandler::<CMax<u16>>::new(2, 64, 5);
        let mut bits = Bitset::new(64);
        for i in 0..64 {
            bits.set(i);
        }
        let mut h2 = HeapHandler::<CMax<u16>>::new(2, 64, 5).with_bitset(bits.view());
        accumulate_qbs(0x2, 64, 4, &packed, &plut, &mut h).unwrap();
        accumulate_qbs(0x2, 64, 4, &packed, &plut, &mut h2).unwrap();
        let (mut d, mut l) = (vec![0.0f32; 10], vec![0i64; 10]);
        h2.to_flat_arrays(&mut d, &mut l, None);
        assert!(l.iter().all(|&x| x == -1));
        h.to_flat_arrays(&mut d, &mut l, None);
        assert!(l.iter().all(|&x| x >= 0));
    }

    #[test]
    fn validation_errors() {
        let (packed, lut) = random_setup(1, 32, 4, 4);
        let plut = pack_lut(0x1, 4, &lut).unwrap();
        let mut h = HeapHandler::<CMax<u16>>::new(1, 32, 1);
        assert!(matches!(
            accumulate(1, 32, 3, &packed, &plut, &mut h),
            Err(QuantError::Alignment(_))
        ));
        assert!(matches!(
            accumulate(1, 33, 4, &packed, &plut, &mut h),
            Err(QuantError::Alignment(_))
        ));
        assert!(matches!(
            accumulate(1, 32, 4, &packed[1..], &plut, &mut h),
            Err(QuantError::Alignment(_))
        ));
        assert!(matches!(
            accumulate(5, 32, 4, &packed, &plut, &mut h),
            Err(QuantError::Configuration(_))
        ));
        assert!(matches!(
            accumulate_qbs(0x103, 32, 4, &packed, &plut, &mut h),
            Err(QuantError::Configuration(_))
        ));
    }
}
