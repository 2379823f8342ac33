//! Property-based tests for the quantization and search primitives.
//!
//! These tests verify invariants that should hold regardless of input:
//! - Distance kernels satisfy metric space properties
//! - Exact KNN returns sorted results that match a full sort
//! - Quantized lookup tables reconstruct float sums within their step
//! - Binary distances are consistent with each other

use proptest::prelude::*;
use quantscan::binary::{and_popcount, jaccard_distance, or_popcount, popcount, xor_popcount};
use quantscan::distance::{knn_extra_metrics, pairwise_distances};
use quantscan::fastscan::quantize_lut;
use quantscan::filtering::BitsetView;
use quantscan::{simd, MetricType};

prop_compose! {
    fn arb_vector(dim: usize)(vec in prop::collection::vec(-10.0f32..10.0, dim)) -> Vec<f32> {
        vec
    }
}

prop_compose! {
    fn arb_code(len: usize)(code in prop::collection::vec(any::<u8>(), len)) -> Vec<u8> {
        code
    }
}

mod distance_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn l2_non_negative_and_symmetric(a in arb_vector(37), b in arb_vector(37)) {
            let d_ab = simd::l2_sqr(&a, &b);
            let d_ba = simd::l2_sqr(&b, &a);
            prop_assert!(d_ab >= 0.0);
            prop_assert!((d_ab - d_ba).abs() <= 1e-3 * (1.0 + d_ab));
            prop_assert!(simd::l2_sqr(&a, &a).abs() < 1e-6);
        }

        #[test]
        fn l2_expands_through_dot(a in arb_vector(24), b in arb_vector(24)) {
            let direct = simd::l2_sqr(&a, &b);
            let expanded = simd::norm_sqr(&a) + simd::norm_sqr(&b) - 2.0 * simd::dot(&a, &b);
            prop_assert!((direct - expanded).abs() <= 1e-3 * (1.0 + direct));
        }

        #[test]
        fn l1_triangle_inequality(a in arb_vector(16), b in arb_vector(16), c in arb_vector(16)) {
            let ab = simd::l1(&a, &b);
            let bc = simd::l1(&b, &c);
            let ac = simd::l1(&a, &c);
            prop_assert!(ac <= ab + bc + 1e-3);
        }

        #[test]
        fn linf_bounded_by_l1(a in arb_vector(16), b in arb_vector(16)) {
            prop_assert!(simd::linf(&a, &b) <= simd::l1(&a, &b) + 1e-4);
        }

        #[test]
        fn renormalized_rows_have_unit_norm(mut x in prop::collection::vec(0.1f32..10.0, 24)) {
            simd::renorm_l2(8, 3, &mut x);
            for row in x.chunks_exact(8) {
                prop_assert!((simd::norm(row) - 1.0).abs() < 1e-4);
            }
        }
    }
}

mod knn_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn knn_matches_full_sort(
            xq in arb_vector(8 * 3),
            xb in arb_vector(8 * 40),
            k in 1usize..12,
        ) {
            let d = 8;
            for metric in [MetricType::L2, MetricType::L1, MetricType::InnerProduct] {
                let (dis, labels) =
                    knn_extra_metrics(&xq, &xb, d, metric, 0.0, k, BitsetView::empty()).unwrap();
                let mut all = vec![0.0f32; 3 * 40];
                pairwise_distances(d, &xq, &xb, metric, 0.0, &mut all).unwrap();
                for q in 0..3 {
                    let mut row = all[q * 40..(q + 1) * 40].to_vec();
                    row.sort_by(f32::total_cmp);
                    if metric.is_similarity() {
                        row.reverse();
                    }
                    for j in 0..k {
                        let l = labels[q * k + j];
                        prop_assert!(l >= 0);
                        prop_assert_eq!(dis[q * k + j], all[q * 40 + l as usize]);
                        prop_assert_eq!(dis[q * k + j], row[j]);
                    }
                }
            }
        }
    }
}

mod lut_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn quantized_sums_stay_within_step(
            lut in prop::collection::vec(-5.0f32..5.0, 4 * 16),
            codes in prop::collection::vec(0usize..16, 4),
        ) {
            let (q, norms) = quantize_lut(&lut, 1, 4).unwrap();
            let (a, b) = (norms[0], norms[1]);
            prop_assert!(a > 0.0);
            let exact: f32 = codes.iter().enumerate().map(|(sq, &c)| lut[sq * 16 + c]).sum();
            let sum: u32 = codes.iter().enumerate().map(|(sq, &c)| u32::from(q[sq * 16 + c])).sum();
            let approx = b + sum as f32 / a;
            prop_assert!((approx - exact).abs() <= 4.0 * 0.5 / a + 1e-4);
        }
    }
}

mod binary_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn hamming_triangle_inequality(a in arb_code(21), b in arb_code(21), c in arb_code(21)) {
            prop_assert!(xor_popcount(&a, &c) <= xor_popcount(&a, &b) + xor_popcount(&b, &c));
        }

        #[test]
        fn inclusion_exclusion(a in arb_code(13), b in arb_code(13)) {
            prop_assert_eq!(
                or_popcount(&a, &b) + and_popcount(&a, &b),
                popcount(&a) + popcount(&b)
            );
        }

        #[test]
        fn jaccard_in_unit_interval_and_zero_on_self(a in arb_code(16), b in arb_code(16)) {
            let d = jaccard_distance(&a, &b);
            prop_assert!((0.0..=1.0).contains(&d));
            prop_assert!((jaccard_distance(&a, &b) - jaccard_distance(&b, &a)).abs() < 1e-6);
            if popcount(&a) > 0 {
                prop_assert!(jaccard_distance(&a, &a).abs() < 1e-6);
            }
        }
    }
}
