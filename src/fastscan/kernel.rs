//! The block kernel: `NQ` queries against 32 database entries.
//!
//! Both implementations model a 256-bit register as two 128-bit lanes. The table lookup
//! works per lane (`vpshufb`), so bytes `0..16` of a code chunk index the first LUT half
//! and bytes `16..32` the second. All `u16` arithmetic wraps.

/// Distances for one query and one block: entries `0..16` and `16..32`.
pub type BlockDistances = [[u16; 16]; 2];

/// Which implementation of the block kernel to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Scalar emulation of the 256-bit lanes.
    Portable,
    /// AVX2 intrinsics (x86_64 only).
    Avx2,
}

impl Kernel {
    /// The fastest kernel this CPU supports.
    #[must_use]
    pub fn detect() -> Self {
        if Self::Avx2.is_available() {
            Self::Avx2
        } else {
            Self::Portable
        }
    }

    /// Whether this kernel can run here.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Portable => true,
            #[cfg(target_arch = "x86_64")]
            Self::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(not(target_arch = "x86_64"))]
            Self::Avx2 => false,
        }
    }
}

/// Accumulate one block. `codes` holds `nsq / 2` chunks of 32 bytes, `lut` holds, for each
/// sub-quantizer pair, 32 bytes per query.
///
/// The caller guarantees `kernel.is_available()`.
#[inline]
pub(crate) fn accumulate_block<const NQ: usize>(
    kernel: Kernel,
    nsq: usize,
    codes: &[u8],
    lut: &[u8],
) -> [BlockDistances; NQ] {
    debug_assert!(codes.len() >= nsq * 16);
    debug_assert!(lut.len() >= NQ * nsq * 16);
    match kernel {
        #[cfg(target_arch = "x86_64")]
        Kernel::Avx2 => {
            // SAFETY: availability is checked by every public entry point.
            unsafe { x86::accumulate_block_avx2::<NQ>(nsq, codes, lut) }
        }
        _ => portable::accumulate_block::<NQ>(nsq, codes, lut),
    }
}

mod portable {
    use super::BlockDistances;

    type U8x32 = [u8; 32];
    type U16x16 = [u16; 16];

    #[inline]
    fn lookup_2_lanes(table: &[u8], idx: &U8x32) -> U8x32 {
        let mut out = [0u8; 32];
        for (i, (o, &ix)) in out.iter_mut().zip(idx).enumerate() {
            let lane = i & 16;
            *o = if ix & 0x80 != 0 {
                0
            } else {
                table[lane + usize::from(ix & 15)]
            };
        }
        out
    }

    #[inline]
    fn as_u16(v: &U8x32) -> U16x16 {
        std::array::from_fn(|j| u16::from(v[2 * j]) | (u16::from(v[2 * j + 1]) << 8))
    }

    #[inline]
    fn add_assign(a: &mut U16x16, b: &U16x16, shift: u32) {
        for (x, &y) in a.iter_mut().zip(b) {
            *x = x.wrapping_add(y >> shift);
        }
    }

    #[inline]
    fn fold_high(lo: &mut U16x16, hi: &U16x16) {
        for (x, &y) in lo.iter_mut().zip(hi) {
            *x = x.wrapping_sub(y << 8);
        }
    }

    /// Lane `0` gets `a.lo + a.hi`, lane `1` gets `b.lo + b.hi`.
    #[inline]
    fn combine2x2(a: &U16x16, b: &U16x16) -> U16x16 {
        std::array::from_fn(|i| {
            let (v, t) = if i < 8 { (a, i) } else { (b, i - 8) };
            v[t].wrapping_add(v[t + 8])
        })
    }

    pub(super) fn accumulate_block<const NQ: usize>(
        nsq: usize,
        codes: &[u8],
        lut: &[u8],
    ) -> [BlockDistances; NQ] {
        let mut accu = [[[0u16; 16]; 4]; NQ];
        for p in 0..nsq / 2 {
            let c: U8x32 = std::array::from_fn(|i| codes[p * 32 + i]);
            let clo: U8x32 = std::array::from_fn(|i| c[i] & 0xf);
            let chi: U8x32 = std::array::from_fn(|i| (c[i] >> 4) & 0xf);
            for (q, acc) in accu.iter_mut().enumerate() {
                let off = (p * NQ + q) * 32;
                let table = &lut[off..off + 32];
                let res0 = as_u16(&lookup_2_lanes(table, &clo));
                let res1 = as_u16(&lookup_2_lanes(table, &chi));
                add_assign(&mut acc[0], &res0, 0);
                add_assign(&mut acc[1], &res0, 8);
                add_assign(&mut acc[2], &res1, 0);
                add_assign(&mut acc[3], &res1, 8);
            }
        }
        std::array::from_fn(|q| {
            let [mut a0, a1, mut a2, a3] = accu[q];
            fold_high(&mut a0, &a1);
            fold_high(&mut a2, &a3);
            [combine2x2(&a0, &a1), combine2x2(&a2, &a3)]
        })
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::BlockDistances;
    use std::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn combine2x2(a: __m256i, b: __m256i) -> __m256i {
        let a1b0 = _mm256_permute2x128_si256::<0x21>(a, b);
        let a0b1 = _mm256_blend_epi32::<0xF0>(a, b);
        _mm256_add_epi16(a1b0, a0b1)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn store(v: __m256i) -> [u16; 16] {
        let mut out = [0u16; 16];
        _mm256_storeu_si256(out.as_mut_ptr().cast::<__m256i>(), v);
        out
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn accumulate_block_avx2<const NQ: usize>(
        nsq: usize,
        codes: &[u8],
        lut: &[u8],
    ) -> [BlockDistances; NQ] {
        let zero = _mm256_setzero_si256();
        let mut accu = [[zero; 4]; NQ];
        let mask = _mm256_set1_epi8(0xf);
        for p in 0..nsq / 2 {
            let chunk = &codes[p * 32..p * 32 + 32];
            let c = _mm256_loadu_si256(chunk.as_ptr().cast::<__m256i>());
            let chi = _mm256_and_si256(_mm256_srli_epi16::<4>(c), mask);
            let clo = _mm256_and_si256(c, mask);
            for (q, acc) in accu.iter_mut().enumerate() {
                let off = (p * NQ + q) * 32;
                let table = &lut[off..off + 32];
                let t = _mm256_loadu_si256(table.as_ptr().cast::<__m256i>());
                let res0 = _mm256_shuffle_epi8(t, clo);
                let res1 = _mm256_shuffle_epi8(t, chi);
                acc[0] = _mm256_add_epi16(acc[0], res0);
                acc[1] = _mm256_add_epi16(acc[1], _mm256_srli_epi16::<8>(res0));
                acc[2] = _mm256_add_epi16(acc[2], res1);
                acc[3] = _mm256_add_epi16(acc[3], _mm256_srli_epi16::<8>(res1));
            }
        }
        let mut out = [[[0u16; 16]; 2]; NQ];
        for (o, acc) in out.iter_mut().zip(accu.iter()) {
            let a0 = _mm256_sub_epi16(acc[0], _mm256_slli_epi16::<8>(acc[1]));
            let a2 = _mm256_sub_epi16(acc[2], _mm256_slli_epi16::<8>(acc[3]));
            o[0] = store(combine2x2(a0, acc[1]));
            o[1] = store(combine2x2(a2, acc[3]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn portable_lookup_uses_lane_local_tables() {
        // one sq pair, one query: table half 0 = i, half 1 = 100 + i
        let lut: Vec<u8> = (0..16u8).chain((0..16u8).map(|i| 100 + i)).collect();
        // all codes zero except entry 0 of sq 0 = 3 and entry 0 of sq 1 = 5
        let mut codes = [0u8; 32];
        codes[0] = 3;
        codes[16] = 5;
        let [d] = accumulate_block::<1>(Kernel::Portable, 2, &codes, &lut);
        assert_eq!(d[0][0], 3 + 105);
        assert_eq!(d[0][1], 100);
        assert_eq!(d[1][0], 100);
    }

    #[test]
    fn avx2_matches_portable() {
        if !Kernel::Avx2.is_available() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(11);
        let nsq = 16;
        let codes: Vec<u8> = (0..nsq * 16).map(|_| rng.random()).collect();
        let lut: Vec<u8> = (0..3 * nsq * 16).map(|_| rng.random()).collect();
        let a = accumulate_block::<3>(Kernel::Portable, nsq, &codes, &lut);
        let b = accumulate_block::<3>(Kernel::Avx2, nsq, &codes, &lut);
        assert_eq!(a, b);
    }
}
