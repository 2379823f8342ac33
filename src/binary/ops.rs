//! Popcount primitives over byte codes.
//!
//! Codes are processed as little-endian 64-bit words followed by a byte tail, so any
//! code size works. Both operands must have the same length.

#[inline]
pub(crate) fn load_u64(bytes: &[u8]) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(w)
}

#[inline]
pub(crate) fn load_u32(bytes: &[u8]) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(w)
}

#[inline]
fn popcount_with(a: &[u8], b: &[u8], op: impl Fn(u64, u64) -> u64) -> u32 {
    debug_assert_eq!(a.len(), b.len());
    let mut wa = a.chunks_exact(8);
    let mut wb = b.chunks_exact(8);
    let mut accu = 0;
    for (x, y) in (&mut wa).zip(&mut wb) {
        accu += op(load_u64(x), load_u64(y)).count_ones();
    }
    for (&x, &y) in wa.remainder().iter().zip(wb.remainder()) {
        accu += op(u64::from(x), u64::from(y)).count_ones();
    }
    accu
}

/// Number of set bits.
#[inline]
#[must_use]
pub fn popcount(a: &[u8]) -> u32 {
    popcount_with(a, a, |x, _| x)
}

/// Hamming distance.
#[inline]
#[must_use]
pub fn xor_popcount(a: &[u8], b: &[u8]) -> u32 {
    popcount_with(a, b, |x, y| x ^ y)
}

/// Size of the intersection.
#[inline]
#[must_use]
pub fn and_popcount(a: &[u8], b: &[u8]) -> u32 {
    popcount_with(a, b, |x, y| x & y)
}

/// Size of the union.
#[inline]
#[must_use]
pub fn or_popcount(a: &[u8], b: &[u8]) -> u32 {
    popcount_with(a, b, |x, y| x | y)
}

/// Whether every bit set in `a` is also set in `b`.
#[must_use]
pub fn is_subset(a: &[u8], b: &[u8]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    let mut wa = a.chunks_exact(8);
    let mut wb = b.chunks_exact(8);
    let words = (&mut wa).zip(&mut wb).all(|(x, y)| {
        let x = load_u64(x);
        x & load_u64(y) == x
    });
    words
        && wa
            .remainder()
            .iter()
            .zip(wb.remainder())
            .all(|(&x, &y)| x & y == x)
}

/// `1 - |a ∩ b| / |a ∪ b|`; two empty codes are at distance 1.
#[must_use]
pub fn jaccard_distance(a: &[u8], b: &[u8]) -> f32 {
    let num = and_popcount(a, b);
    let den = or_popcount(a, b);
    if num == 0 {
        1.0
    } else {
        1.0 - num as f32 / den as f32
    }
}
