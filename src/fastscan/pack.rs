//! Code and LUT layouts consumed by the block kernel.

use super::{qbs_groups, AlignedBytes, BLOCK_SIZE};
use crate::error::{check_dim, QuantError, Result};

/// Position of entry `t` (0..16) inside a 16-byte lane: even bytes hold `0..8`, odd bytes
/// `8..16`.
const PERM0: [usize; 16] = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];

/// Round `m` sub-quantizers up to the even count the kernel needs.
#[must_use]
pub fn padded_nsq(m: usize) -> usize {
    m + (m & 1)
}

/// Round `ntotal` up to a whole number of blocks.
#[must_use]
pub fn padded_ntotal(ntotal: usize) -> usize {
    ntotal.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Pack `ntotal` codes of `m` 4-bit sub-codes (one per byte, `0..16`) into kernel blocks.
///
/// The output covers `padded_ntotal(ntotal)` entries and `padded_nsq(m)` sub-quantizers;
/// padding entries and padding sub-quantizers are zero.
pub fn pack_codes(codes: &[u8], ntotal: usize, m: usize) -> Result<AlignedBytes> {
    check_dim(ntotal * m, codes.len())?;
    if m == 0 {
        return Err(QuantError::Configuration(
            "need at least one sub-quantizer".into(),
        ));
    }
    if let Some(&c) = codes.iter().find(|&&c| c > 15) {
        return Err(QuantError::InvalidInput(format!(
            "sub-code {c} does not fit in 4 bits"
        )));
    }
    let nsq = padded_nsq(m);
    let ntotal2 = padded_ntotal(ntotal);
    let mut out = AlignedBytes::zeroed(ntotal2 * nsq / 2);
    let code = |i: usize, sq: usize| -> u8 {
        if i < ntotal && sq < m {
            codes[i * m + sq]
        } else {
            0
        }
    };
    for (blk, block) in out.chunks_exact_mut(BLOCK_SIZE * nsq / 2).enumerate() {
        let base = blk * BLOCK_SIZE;
        for (pair, chunk) in block.chunks_exact_mut(32).enumerate() {
            for lane in 0..2 {
                let sq = 2 * pair + lane;
                for (byte, &t) in PERM0.iter().enumerate() {
                    let lo = code(base + t, sq);
                    let hi = code(base + t + 16, sq);
                    chunk[lane * 16 + byte] = lo | (hi << 4);
                }
            }
        }
    }
    Ok(out)
}

/// Read back sub-code `sq` of entry `i` from a packed buffer.
#[must_use]
pub fn get_packed_element(packed: &[u8], nsq: usize, i: usize, sq: usize) -> u8 {
    let block = &packed[(i / BLOCK_SIZE) * BLOCK_SIZE * nsq / 2..];
    let t = i % BLOCK_SIZE;
    let (t16, high) = if t < 16 { (t, false) } else { (t - 16, true) };
    let byte = PERM0.iter().position(|&p| p == t16).unwrap_or(0);
    let v = block[(sq / 2) * 32 + (sq & 1) * 16 + byte];
    if high {
        v >> 4
    } else {
        v & 0xf
    }
}

/// Rearrange per-query tables `[q][sq][16]` into the layout for query batch shape `qbs`:
/// for each group, for each sub-quantizer pair, 32 bytes per query.
pub fn pack_lut(qbs: usize, nsq: usize, lut: &[u8]) -> Result<AlignedBytes> {
    let groups = qbs_groups(qbs)?;
    if nsq == 0 || nsq % 2 != 0 {
        return Err(QuantError::Alignment(format!(
            "number of sub-quantizers {nsq} must be even and positive"
        )));
    }
    let nq: usize = groups.iter().sum();
    let dim12 = nsq * 16;
    check_dim(nq * dim12, lut.len())?;
    let mut out = AlignedBytes::zeroed(nq * dim12);
    let mut dst = 0;
    let mut q0 = 0;
    for &g in &groups {
        for pair in 0..nsq / 2 {
            for q in q0..q0 + g {
                let src = q * dim12 + pair * 32;
                out[dst..dst + 32].copy_from_slice(&lut[src..src + 32]);
                dst += 32;
            }
        }
        q0 += g;
    }
    Ok(out)
}

/// Quantize float tables `[q][sq][16]` to bytes.
///
/// Each sub-table is shifted by its minimum and all are scaled by one factor `a` per query,
/// chosen so that the widest sub-table spans `0..=255`. A sum of quantized entries `s`
/// maps back to `b + s / a`, where `b` is the sum of the minima. Returns the bytes and
/// `(a, b)` per query, flattened.
pub fn quantize_lut(lut: &[f32], nq: usize, nsq: usize) -> Result<(Vec<u8>, Vec<f32>)> {
    check_dim(nq * nsq * 16, lut.len())?;
    let mut out = vec![0u8; lut.len()];
    let mut normalizers = Vec::with_capacity(2 * nq);
    if nsq == 0 {
        normalizers.resize(2 * nq, 0.0);
        return Ok((out, normalizers));
    }
    for (tab, dst) in lut.chunks_exact(nsq * 16).zip(out.chunks_exact_mut(nsq * 16)) {
        let mins: Vec<f32> = tab
            .chunks_exact(16)
            .map(|t| t.iter().copied().fold(f32::INFINITY, f32::min))
            .collect();
        let max_span = tab
            .chunks_exact(16)
            .zip(&mins)
            .map(|(t, &mn)| t.iter().copied().fold(f32::NEG_INFINITY, f32::max) - mn)
            .fold(0.0f32, f32::max);
        let a = if max_span > 0.0 { 255.0 / max_span } else { 1.0 };
        let b: f32 = mins.iter().sum();
        for ((t, d), &mn) in tab.chunks_exact(16).zip(dst.chunks_exact_mut(16)).zip(&mins) {
            for (&v, o) in t.iter().zip(d.iter_mut()) {
                *o = ((v - mn) * a + 0.5).floor().clamp(0.0, 255.0) as u8;
            }
        }
        normalizers.push(a);
        normalizers.push(b);
    }
    Ok((out, normalizers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pads_sub_quantizers_and_entries() {
        let codes = [1u8, 2, 3];
        let packed = pack_codes(&codes, 1, 3).unwrap();
        assert_eq!(packed.len(), 32 * 4 / 2);
        assert_eq!(get_packed_element(&packed, 4, 0, 2), 3);
        assert_eq!(get_packed_element(&packed, 4, 0, 3), 0);
        assert_eq!(get_packed_element(&packed, 4, 5, 0), 0);
    }

    #[test]
    fn rejects_wide_codes() {
        assert!(matches!(
            pack_codes(&[16], 1, 1),
            Err(QuantError::InvalidInput(_))
        ));
    }

    #[test]
    fn lut_groups_are_contiguous() {
        // 3 queries, nsq = 2: query q has every byte equal to q
        let lut: Vec<u8> = (0..3u8).flat_map(|q| std::iter::repeat(q).take(32)).collect();
        let packed = pack_lut(0x12, 2, &lut).unwrap();
        assert!(packed[..64].iter().enumerate().all(|(i, &v)| v == (i / 32) as u8));
        assert!(packed[64..].iter().all(|&v| v == 2));
    }

    #[test]
    fn quantized_lut_reconstructs_sums() {
        let nsq = 2;
        let lut: Vec<f32> = (0..nsq * 16).map(|i| (i % 16) as f32 * 0.5 + (i / 16) as f32).collect();
        let (q, norm) = quantize_lut(&lut, 1, nsq).unwrap();
        let (a, b) = (norm[0], norm[1]);
        for i in 0..16 {
            for j in 0..16 {
                let exact = lut[i] + lut[16 + j];
                let approx = b + (f32::from(q[i]) + f32::from(q[16 + j])) / a;
                assert!((exact - approx).abs() < 2.0 / a);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_packed_elements_read_back(ntotal in 1usize..80, m in 1usize..7, seed in any::<u64>()) {
            let codes: Vec<u8> = (0..ntotal * m)
                .map(|i| ((i as u64).wrapping_mul(seed | 1) >> 7) as u8 & 15)
                .collect();
            let packed = pack_codes(&codes, ntotal, m).unwrap();
            let nsq = padded_nsq(m);
            for i in 0..ntotal {
                for sq in 0..m {
                    prop_assert_eq!(get_packed_element(&packed, nsq, i, sq), codes[i * m + sq]);
                }
            }
        }
    }
}
