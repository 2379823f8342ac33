//! TLSH digest distance.
//!
//! A binary TLSH digest is 35 bytes:
//!
//! | byte | field |
//! |------|-------|
//! | 0 | checksum |
//! | 1 | L-value (log of the input length) |
//! | 2 | Q ratios: `q1` in the low nibble, `q2` in the high nibble |
//! | 3..35 | body: 128 buckets of 2 bits |
//!
//! Distances are integers but reported as `f32` so they share the float heap path.

use crate::error::{QuantError, Result};
use crate::metric::MetricType;

/// Size of a binary TLSH digest.
pub const TLSH_DIGEST_LEN: usize = 35;

const BODY_LEN: usize = 32;
const RANGE_LVALUE: u32 = 256;
const RANGE_QRATIO: u32 = 16;

/// Parsed TLSH digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlshDigest {
    pub checksum: u8,
    pub lvalue: u8,
    pub q1_ratio: u8,
    pub q2_ratio: u8,
    pub body: [u8; BODY_LEN],
}

impl TlshDigest {
    /// Parse a 35-byte digest.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TLSH_DIGEST_LEN {
            return Err(QuantError::UnsupportedMetric {
                metric: MetricType::Tlsh,
                code_size: bytes.len(),
            });
        }
        Ok(Self::read(bytes))
    }

    /// Parse the first 35 bytes of `bytes`.
    #[inline]
    pub(crate) fn read(bytes: &[u8]) -> Self {
        let mut body = [0u8; BODY_LEN];
        body.copy_from_slice(&bytes[3..TLSH_DIGEST_LEN]);
        Self {
            checksum: bytes[0],
            lvalue: bytes[1],
            q1_ratio: bytes[2] & 0xf,
            q2_ratio: bytes[2] >> 4,
            body,
        }
    }

    /// Serialize back to the 35-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TLSH_DIGEST_LEN] {
        let mut out = [0u8; TLSH_DIGEST_LEN];
        out[0] = self.checksum;
        out[1] = self.lvalue;
        out[2] = (self.q1_ratio & 0xf) | (self.q2_ratio << 4);
        out[3..].copy_from_slice(&self.body);
        out
    }

    /// Distance to `other`; `len_diff` includes the L-value term.
    #[must_use]
    pub fn diff(&self, other: &Self, len_diff: bool) -> i32 {
        let mut diff = 0;
        if len_diff {
            let ldiff = mod_diff(u32::from(self.lvalue), u32::from(other.lvalue), RANGE_LVALUE);
            diff += if ldiff <= 1 { ldiff } else { ldiff * 12 };
        }
        for (a, b) in [(self.q1_ratio, other.q1_ratio), (self.q2_ratio, other.q2_ratio)] {
            let qdiff = mod_diff(u32::from(a), u32::from(b), RANGE_QRATIO);
            diff += if qdiff <= 1 { qdiff } else { (qdiff - 1) * 12 };
        }
        if self.checksum != other.checksum {
            diff += 1;
        }
        diff as i32 + body_distance(&self.body, &other.body)
    }
}

/// Distance on a ring of size `r`.
#[inline]
fn mod_diff(x: u32, y: u32, r: u32) -> u32 {
    let (dl, dr) = if y > x { (y - x, x + r - y) } else { (x - y, y + r - x) };
    dl.min(dr)
}

/// Sum over 2-bit buckets of `|a - b|`, where a difference of 3 counts as 6.
fn body_distance(a: &[u8; BODY_LEN], b: &[u8; BODY_LEN]) -> i32 {
    let mut diff = 0;
    for (&x, &y) in a.iter().zip(b) {
        for shift in [0, 2, 4, 6] {
            let d = ((x >> shift) & 3).abs_diff((y >> shift) & 3);
            diff += if d == 3 { 6 } else { i32::from(d) };
        }
    }
    diff
}

/// Distance between two raw digests, with the L-value term.
#[inline]
#[must_use]
pub fn tlsh_distance(a: &[u8], b: &[u8]) -> f32 {
    TlshDigest::read(a).diff(&TlshDigest::read(b), true) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> TlshDigest {
        TlshDigest {
            checksum: 0x5a,
            lvalue: 10,
            q1_ratio: 3,
            q2_ratio: 7,
            body: std::array::from_fn(|i| (i * 37) as u8),
        }
    }

    #[test]
    fn identical_digests_are_at_zero() {
        let d = digest();
        assert_eq!(d.diff(&d, true), 0);
        let bytes = d.to_bytes();
        assert_eq!(tlsh_distance(&bytes, &bytes), 0.0);
        assert_eq!(TlshDigest::from_bytes(&bytes).unwrap(), d);
    }

    #[test]
    fn header_terms() {
        let a = digest();
        let mut b = a;
        b.lvalue = 11;
        assert_eq!(a.diff(&b, true), 1);
        assert_eq!(a.diff(&b, false), 0);
        b.lvalue = 12;
        assert_eq!(a.diff(&b, true), 24);
        // the L-value ring wraps
        let mut c = a;
        c.lvalue = 0;
        let mut e = a;
        e.lvalue = 255;
        assert_eq!(c.diff(&e, true), 1);

        let mut q = a;
        q.q1_ratio = 6;
        assert_eq!(a.diff(&q, true), 24);
        q.checksum = 0;
        assert_eq!(a.diff(&q, true), 25);
    }

    #[test]
    fn body_buckets() {
        let a = digest();
        assert_eq!(a.body[0], 0);
        let mut b = a;
        // bucket 0: 0 -> 3 counts 6, bucket 1: 0 -> 1 counts 1
        b.body[0] = 0b0111;
        assert_eq!(a.diff(&b, true), 7);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(
            TlshDigest::from_bytes(&[0; 34]),
            Err(QuantError::UnsupportedMetric { code_size: 34, .. })
        ));
    }
}
