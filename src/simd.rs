//! Float vector kernels with SIMD acceleration.
//!
//! Every kernel has a portable implementation written with 8 independent accumulators so
//! LLVM can vectorize it, and an AVX2 implementation selected at runtime on x86_64. When the
//! `innr` feature is enabled, `dot`, `l2_sqr` and `norm` come from the `innr` crate instead.
//!
//! Inputs are assumed to have equal length; callers validate dimensions up front.
//!
//! ```rust
//! use quantscan::simd::{dot, l2_sqr, norm};
//!
//! let a = [1.0_f32, 0.0, 0.0];
//! let b = [0.0_f32, 1.0, 0.0];
//! assert_eq!(dot(&a, &b), 0.0);
//! assert_eq!(l2_sqr(&a, &b), 2.0);
//! assert_eq!(norm(&a), 1.0);
//! ```

/// Vectors shorter than this stay on the portable path.
const MIN_DIM_SIMD: usize = 16;

const LANES: usize = 8;

#[cfg(target_arch = "x86_64")]
#[inline]
fn use_avx2(len: usize) -> bool {
    len >= MIN_DIM_SIMD && is_x86_feature_detected!("avx2")
}

/// Inner product.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(feature = "innr")]
    {
        innr::dot(a, b)
    }
    #[cfg(not(feature = "innr"))]
    {
        #[cfg(target_arch = "x86_64")]
        if use_avx2(a.len()) {
            // SAFETY: AVX2 availability checked at runtime.
            return unsafe { x86::dot_avx2(a, b) };
        }
        portable::dot(a, b)
    }
}

/// Squared L2 distance.
#[inline]
#[must_use]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(feature = "innr")]
    {
        innr::l2_distance_squared(a, b)
    }
    #[cfg(not(feature = "innr"))]
    {
        #[cfg(target_arch = "x86_64")]
        if use_avx2(a.len()) {
            // SAFETY: AVX2 availability checked at runtime.
            return unsafe { x86::l2_sqr_avx2(a, b) };
        }
        portable::l2_sqr(a, b)
    }
}

/// L1 distance.
#[inline]
#[must_use]
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    if use_avx2(a.len()) {
        // SAFETY: AVX2 availability checked at runtime.
        return unsafe { x86::l1_avx2(a, b) };
    }
    portable::l1(a, b)
}

/// L-infinity distance.
#[inline]
#[must_use]
pub fn linf(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    if use_avx2(a.len()) {
        // SAFETY: AVX2 availability checked at runtime.
        return unsafe { x86::linf_avx2(a, b) };
    }
    portable::linf(a, b)
}

/// Squared L2 norm.
#[inline]
#[must_use]
pub fn norm_sqr(v: &[f32]) -> f32 {
    dot(v, v)
}

/// L2 norm.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    #[cfg(feature = "innr")]
    {
        innr::norm(v)
    }
    #[cfg(not(feature = "innr"))]
    {
        norm_sqr(v).sqrt()
    }
}

/// L2-normalize each of the `n` rows of `x` in place. Zero rows are left untouched.
pub fn renorm_l2(d: usize, n: usize, x: &mut [f32]) {
    debug_assert!(x.len() >= n * d);
    for row in x.chunks_exact_mut(d).take(n) {
        let nr = norm_sqr(row);
        if nr > 0.0 {
            let inv = 1.0 / nr.sqrt();
            for v in row.iter_mut() {
                *v *= inv;
            }
        }
    }
}

/// Squared norms of `n` rows.
pub fn norms_sqr(x: &[f32], d: usize, n: usize) -> Vec<f32> {
    x.chunks_exact(d).take(n).map(norm_sqr).collect()
}

/// Squared L2 distances from `x` to each of the `ny` rows of `y`.
pub fn l2_sqr_ny(dis: &mut [f32], x: &[f32], y: &[f32], d: usize, ny: usize) {
    for (out, yj) in dis.iter_mut().zip(y.chunks_exact(d)).take(ny) {
        *out = l2_sqr(x, yj);
    }
}

/// Inner products of `x` with each of the `ny` rows of `y`.
pub fn inner_products_ny(ip: &mut [f32], x: &[f32], y: &[f32], d: usize, ny: usize) {
    for (out, yj) in ip.iter_mut().zip(y.chunks_exact(d)).take(ny) {
        *out = dot(x, yj);
    }
}

/// `c = a + bf * b`.
pub fn madd(a: &[f32], bf: f32, b: &[f32], c: &mut [f32]) {
    for ((ci, &ai), &bi) in c.iter_mut().zip(a).zip(b) {
        *ci = ai + bf * bi;
    }
}

/// `c = a + bf * b`, returning the index of the smallest entry of `c`.
pub fn madd_and_argmin(a: &[f32], bf: f32, b: &[f32], c: &mut [f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, ((ci, &ai), &bi)) in c.iter_mut().zip(a).zip(b).enumerate() {
        *ci = ai + bf * bi;
        if best.map_or(true, |(_, v)| *ci < v) {
            best = Some((i, *ci));
        }
    }
    best.map(|(i, _)| i)
}

mod portable {
    //! Reference kernels; also used as the tail of the vectorized paths.

    use super::LANES;

    #[inline]
    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        let mut acc = [0.0f32; LANES];
        let ca = a.chunks_exact(LANES);
        let cb = b.chunks_exact(LANES);
        let (ra, rb) = (ca.remainder(), cb.remainder());
        for (xa, xb) in ca.zip(cb) {
            for i in 0..LANES {
                acc[i] += xa[i] * xb[i];
            }
        }
        let mut s: f32 = acc.iter().sum();
        for (x, y) in ra.iter().zip(rb) {
            s += x * y;
        }
        s
    }

    #[inline]
    pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
        let mut acc = [0.0f32; LANES];
        let ca = a.chunks_exact(LANES);
        let cb = b.chunks_exact(LANES);
        let (ra, rb) = (ca.remainder(), cb.remainder());
        for (xa, xb) in ca.zip(cb) {
            for i in 0..LANES {
                let d = xa[i] - xb[i];
                acc[i] += d * d;
            }
        }
        let mut s: f32 = acc.iter().sum();
        for (x, y) in ra.iter().zip(rb) {
            let d = x - y;
            s += d * d;
        }
        s
    }

    #[inline]
    pub fn l1(a: &[f32], b: &[f32]) -> f32 {
        let mut acc = [0.0f32; LANES];
        let ca = a.chunks_exact(LANES);
        let cb = b.chunks_exact(LANES);
        let (ra, rb) = (ca.remainder(), cb.remainder());
        for (xa, xb) in ca.zip(cb) {
            for i in 0..LANES {
                acc[i] += (xa[i] - xb[i]).abs();
            }
        }
        let mut s: f32 = acc.iter().sum();
        for (x, y) in ra.iter().zip(rb) {
            s += (x - y).abs();
        }
        s
    }

    #[inline]
    pub fn linf(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max)
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    //! AVX2 kernels. Callers must check `is_x86_feature_detected!("avx2")`.

    use super::portable;
    use std::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn hsum(v: __m256) -> f32 {
        let lo = _mm256_castps256_ps128(v);
        let hi = _mm256_extractf128_ps(v, 1);
        let s = _mm_add_ps(lo, hi);
        let s = _mm_add_ps(s, _mm_movehl_ps(s, s));
        let s = _mm_add_ss(s, _mm_shuffle_ps(s, s, 0x55));
        _mm_cvtss_f32(s)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn hmax(v: __m256) -> f32 {
        let mut lanes = [0.0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), v);
        lanes.iter().copied().fold(0.0f32, f32::max)
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let body = n - n % 8;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
            i += 8;
        }
        hsum(acc) + portable::dot(&a[body..n], &b[body..n])
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn l2_sqr_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let body = n - n % 8;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            let d = _mm256_sub_ps(va, vb);
            acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
            i += 8;
        }
        hsum(acc) + portable::l2_sqr(&a[body..n], &b[body..n])
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn l1_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let body = n - n % 8;
        let sign = _mm256_set1_ps(-0.0);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            let d = _mm256_andnot_ps(sign, _mm256_sub_ps(va, vb));
            acc = _mm256_add_ps(acc, d);
            i += 8;
        }
        hsum(acc) + portable::l1(&a[body..n], &b[body..n])
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn linf_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let body = n - n % 8;
        let sign = _mm256_set1_ps(-0.0);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            let d = _mm256_andnot_ps(sign, _mm256_sub_ps(va, vb));
            acc = _mm256_max_ps(acc, d);
            i += 8;
        }
        hmax(acc).max(portable::linf(&a[body..n], &b[body..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_dot_basic() {
        let a = [1.0_f32, 2.0, 3.0];
        let b = [4.0_f32, 5.0, 6.0];
        assert!((dot(&a, &b) - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_norm() {
        let v = [3.0_f32, 4.0];
        assert!((norm(&v) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_l1_linf() {
        let a = [0.0_f32, 0.0, 0.0];
        let b = [1.0_f32, -2.0, 3.0];
        assert_eq!(l1(&a, &b), 6.0);
        assert_eq!(linf(&a, &b), 3.0);
    }

    #[test]
    fn test_renorm_skips_zero_rows() {
        let mut x = vec![3.0_f32, 4.0, 0.0, 0.0];
        renorm_l2(2, 2, &mut x);
        assert!((x[0] - 0.6).abs() < 1e-6);
        assert!((x[1] - 0.8).abs() < 1e-6);
        assert_eq!(&x[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_madd_and_argmin() {
        let a = [1.0_f32, 5.0, 2.0];
        let b = [1.0_f32, -4.0, 0.0];
        let mut c = [0.0f32; 3];
        assert_eq!(madd_and_argmin(&a, 1.0, &b, &mut c), Some(1));
        assert_eq!(c, [2.0, 1.0, 2.0]);
        assert_eq!(madd_and_argmin(&[], 1.0, &[], &mut []), None);
    }

    proptest! {
        #[test]
        fn prop_dispatch_matches_portable(
            v in proptest::collection::vec(-10.0f32..10.0, 2..200),
        ) {
            let half = v.len() / 2;
            let (a, b) = (&v[..half], &v[half..2 * half]);
            let tol = 1e-3 * (1.0 + portable::l2_sqr(a, b));
            prop_assert!((l2_sqr(a, b) - portable::l2_sqr(a, b)).abs() <= tol);
            prop_assert!((dot(a, b) - portable::dot(a, b)).abs() <= 1e-3 * (1.0 + portable::dot(a, b).abs()));
            prop_assert!((l1(a, b) - portable::l1(a, b)).abs() <= 1e-3 * (1.0 + portable::l1(a, b)));
            prop_assert_eq!(linf(a, b), portable::linf(a, b));
        }
    }
}
