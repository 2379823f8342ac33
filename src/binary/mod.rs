//! Exact search over binary codes.
//!
//! Binary codes are rows of `code_size` bytes in natural order. Supported metrics:
//!
//! | Metric | Result | Entry point |
//! |--------|--------|-------------|
//! | Hamming | `i32` bit count | [`knn_hamming`], [`knn`] (as `f32`), [`range_search`] |
//! | Jaccard | `1 - \|a ∩ b\| / \|a ∪ b\|` | [`knn`], [`range_search`] |
//! | TLSH | digest distance, 35-byte codes | [`knn`], [`range_search`] |
//! | Substructure / Superstructure | match or not | [`knn_match`] |
//!
//! The computer for a `(metric, code_size)` pair is picked once per call; common sizes get
//! word-level specialisations (see [`computers`]).
//!
//! ```
//! use quantscan::binary::{knn_hamming, range_search};
//! use quantscan::filtering::BitsetView;
//! use quantscan::MetricType;
//!
//! let db = [0x00u8, 0x01, 0x03, 0xFF];
//! let (dis, labels) = knn_hamming(&[0x00], &db, 2, 1, BitsetView::empty())?;
//! assert_eq!(dis, [0, 1]);
//! assert_eq!(labels, [0, 1]);
//!
//! let res = range_search(MetricType::Hamming, &[0x00], &db, 2.0, 1, BitsetView::empty())?;
//! assert_eq!(res.query(0).0, &[0, 1]);
//! # Ok::<(), quantscan::QuantError>(())
//! ```

pub mod computers;
mod ops;
mod search;
pub mod tlsh;

pub use computers::BinaryComputer;
pub use ops::{and_popcount, is_subset, jaccard_distance, or_popcount, popcount, xor_popcount};
pub use tlsh::{tlsh_distance, TlshDigest, TLSH_DIGEST_LEN};

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::filtering::BitsetView;
use crate::heap::CMax;
use crate::metric::MetricType;
use crate::range::RangeSearchResult;
use computers::*;
use search::Scan;

/// Default cache budget used to size database tiles.
pub const DEFAULT_L3_SIZE: usize = 12 << 20;

/// How a scan is parallelized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStrategy {
    /// Pick from the query count, database size and cache budget.
    #[default]
    Auto,
    /// Split the database across workers, private results per worker.
    QueryMajor,
    /// Walk the database in tiles, split queries across workers.
    DatabaseMajor,
}

/// Tuning for binary scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySearchParams {
    /// Cache budget in bytes.
    pub l3_size: usize,
    pub strategy: SearchStrategy,
}

impl Default for BinarySearchParams {
    fn default() -> Self {
        Self {
            l3_size: DEFAULT_L3_SIZE,
            strategy: SearchStrategy::Auto,
        }
    }
}

macro_rules! dispatch_hamming {
    ($code_size:expr, $M:ident => $body:expr) => {
        match $code_size {
            4 => {
                type $M = HammingComputer4;
                $body
            }
            8 => {
                type $M = HammingComputer8;
                $body
            }
            16 => {
                type $M = HammingComputer16;
                $body
            }
            20 => {
                type $M = HammingComputer20;
                $body
            }
            32 => {
                type $M = HammingComputer32;
                $body
            }
            64 => {
                type $M = HammingComputer64;
                $body
            }
            _ => {
                type $M = HammingComputerDefault;
                $body
            }
        }
    };
}

macro_rules! dispatch_words {
    ($code_size:expr, $Words:ident < _ $(, $post:literal)? >, $Default:ty, $M:ident => $body:expr) => {
        match $code_size {
            8 => {
                type $M = $Words<1 $(, $post)?>;
                $body
            }
            16 => {
                type $M = $Words<2 $(, $post)?>;
                $body
            }
            32 => {
                type $M = $Words<4 $(, $post)?>;
                $body
            }
            64 => {
                type $M = $Words<8 $(, $post)?>;
                $body
            }
            128 => {
                type $M = $Words<16 $(, $post)?>;
                $body
            }
            256 => {
                type $M = $Words<32 $(, $post)?>;
                $body
            }
            512 => {
                type $M = $Words<64 $(, $post)?>;
                $body
            }
            _ => {
                type $M = $Default;
                $body
            }
        }
    };
}

impl BinarySearchParams {
    #[must_use]
    pub fn with_l3_size(mut self, l3_size: usize) -> Self {
        self.l3_size = l3_size;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Top-`k` Hamming neighbors: `(distances, labels)`, `nq * k` each, best first.
    /// Missing neighbors are `(i32::MAX, -1)`.
    pub fn knn_hamming(
        &self,
        queries: &[u8],
        db: &[u8],
        k: usize,
        code_size: usize,
        filter: BitsetView<'_>,
    ) -> Result<(Vec<i32>, Vec<i64>)> {
        let scan = checked_scan(queries, db, code_size, filter)?;
        Ok(dispatch_hamming!(code_size, M => search::knn_hc::<M, CMax<i32>>(self, &scan, k)))
    }

    /// Top-`k` neighbors with `f32` distances for Hamming, Jaccard and TLSH.
    /// Missing neighbors are `(f32::INFINITY, -1)`.
    pub fn knn(
        &self,
        metric: MetricType,
        queries: &[u8],
        db: &[u8],
        k: usize,
        code_size: usize,
        filter: BitsetView<'_>,
    ) -> Result<(Vec<f32>, Vec<i64>)> {
        match metric {
            MetricType::Hamming => {
                let (dis, labels) = self.knn_hamming(queries, db, k, code_size, filter)?;
                let dis = dis
                    .iter()
                    .zip(&labels)
                    .map(|(&d, &l)| if l < 0 { f32::INFINITY } else { d as f32 })
                    .collect();
                Ok((dis, labels))
            }
            MetricType::Jaccard => {
                let scan = checked_scan(queries, db, code_size, filter)?;
                Ok(dispatch_words!(
                    code_size,
                    JaccardComputerWords<_>,
                    JaccardComputerDefault,
                    M => search::knn_hc::<M, CMax<f32>>(self, &scan, k)
                ))
            }
            MetricType::Tlsh => {
                check_tlsh(code_size)?;
                let scan = checked_scan(queries, db, code_size, filter)?;
                Ok(search::knn_hc::<TlshComputer, CMax<f32>>(self, &scan, k))
            }
            _ => Err(QuantError::UnsupportedMetric { metric, code_size }),
        }
    }

    /// Up to `k` database entries matching each query under a structure metric, in
    /// database order. Hits have distance 0, missing ones `(f32::INFINITY, -1)`.
    pub fn knn_match(
        &self,
        metric: MetricType,
        queries: &[u8],
        db: &[u8],
        k: usize,
        code_size: usize,
        filter: BitsetView<'_>,
    ) -> Result<(Vec<f32>, Vec<i64>)> {
        let scan = checked_scan(queries, db, code_size, filter)?;
        match metric {
            MetricType::Substructure => Ok(dispatch_words!(
                code_size,
                StructureComputerWords<_, true>,
                StructureComputerDefault<true>,
                M => search::knn_mc::<M>(self, &scan, k)
            )),
            MetricType::Superstructure => Ok(dispatch_words!(
                code_size,
                StructureComputerWords<_, false>,
                StructureComputerDefault<false>,
                M => search::knn_mc::<M>(self, &scan, k)
            )),
            _ => Err(QuantError::UnsupportedMetric { metric, code_size }),
        }
    }

    /// Every database entry with distance strictly below `radius`.
    pub fn range_search(
        &self,
        metric: MetricType,
        queries: &[u8],
        db: &[u8],
        radius: f32,
        code_size: usize,
        filter: BitsetView<'_>,
    ) -> Result<RangeSearchResult> {
        match metric {
            MetricType::Hamming => {
                let scan = checked_scan(queries, db, code_size, filter)?;
                Ok(dispatch_hamming!(code_size, M => search::range::<M>(&scan, radius)))
            }
            MetricType::Jaccard => {
                let scan = checked_scan(queries, db, code_size, filter)?;
                Ok(dispatch_words!(
                    code_size,
                    JaccardComputerWords<_>,
                    JaccardComputerDefault,
                    M => search::range::<M>(&scan, radius)
                ))
            }
            MetricType::Tlsh => {
                check_tlsh(code_size)?;
                let scan = checked_scan(queries, db, code_size, filter)?;
                Ok(search::range::<TlshComputer>(&scan, radius))
            }
            _ => Err(QuantError::UnsupportedMetric { metric, code_size }),
        }
    }
}

fn checked_scan<'a>(
    queries: &'a [u8],
    db: &'a [u8],
    code_size: usize,
    filter: BitsetView<'a>,
) -> Result<Scan<'a>> {
    if code_size == 0 {
        return Err(QuantError::Configuration("code size must be positive".into()));
    }
    for (what, buf) in [("query", queries), ("database", db)] {
        if buf.len() % code_size != 0 {
            return Err(QuantError::InvalidInput(format!(
                "{what} buffer of {} bytes is not a whole number of {code_size}-byte codes",
                buf.len()
            )));
        }
    }
    Ok(Scan {
        queries,
        db,
        code_size,
        nq: queries.len() / code_size,
        nb: db.len() / code_size,
        filter,
    })
}

fn check_tlsh(code_size: usize) -> Result<()> {
    if code_size != TLSH_DIGEST_LEN {
        return Err(QuantError::UnsupportedMetric {
            metric: MetricType::Tlsh,
            code_size,
        });
    }
    Ok(())
}

/// [`BinarySearchParams::knn_hamming`] with default parameters.
pub fn knn_hamming(
    queries: &[u8],
    db: &[u8],
    k: usize,
    code_size: usize,
    filter: BitsetView<'_>,
) -> Result<(Vec<i32>, Vec<i64>)> {
    BinarySearchParams::default().knn_hamming(queries, db, k, code_size, filter)
}

/// [`BinarySearchParams::knn`] with default parameters.
pub fn knn(
    metric: MetricType,
    queries: &[u8],
    db: &[u8],
    k: usize,
    code_size: usize,
    filter: BitsetView<'_>,
) -> Result<(Vec<f32>, Vec<i64>)> {
    BinarySearchParams::default().knn(metric, queries, db, k, code_size, filter)
}

/// [`BinarySearchParams::knn_match`] with default parameters.
pub fn knn_match(
    metric: MetricType,
    queries: &[u8],
    db: &[u8],
    k: usize,
    code_size: usize,
    filter: BitsetView<'_>,
) -> Result<(Vec<f32>, Vec<i64>)> {
    BinarySearchParams::default().knn_match(metric, queries, db, k, code_size, filter)
}

/// [`BinarySearchParams::range_search`] with default parameters.
pub fn range_search(
    metric: MetricType,
    queries: &[u8],
    db: &[u8],
    radius: f32,
    code_size: usize,
    filter: BitsetView<'_>,
) -> Result<RangeSearchResult> {
    BinarySearchParams::default().range_search(metric, queries, db, radius, code_size, filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::Bitset;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_codes(n: usize, code_size: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * code_size).map(|_| rng.random()).collect()
    }

    fn strategies() -> [BinarySearchParams; 3] {
        let p = BinarySearchParams::default();
        [
            p.with_strategy(SearchStrategy::QueryMajor),
            // tiny tiles so the database is walked in many pieces
            p.with_strategy(SearchStrategy::DatabaseMajor).with_l3_size(64),
            p,
        ]
    }

    fn brute_hamming(q: &[u8], db: &[u8], cs: usize, k: usize) -> Vec<(i32, i64)> {
        let mut all: Vec<(i32, i64)> = db
            .chunks_exact(cs)
            .enumerate()
            .map(|(j, c)| (xor_popcount(q, c) as i32, j as i64))
            .collect();
        all.sort_unstable();
        all.truncate(k);
        all
    }

    #[test]
    fn hamming_matches_brute_force_for_all_sizes() {
        for cs in [4usize, 8, 16, 20, 32, 64, 7] {
            let db = random_codes(300, cs, cs as u64);
            let queries = random_codes(5, cs, 100 + cs as u64);
            for params in strategies() {
                let (dis, labels) = params
                    .knn_hamming(&queries, &db, 7, cs, BitsetView::empty())
                    .unwrap();
                for (i, q) in queries.chunks_exact(cs).enumerate() {
                    let expect = brute_hamming(q, &db, cs, 7);
                    let got: Vec<(i32, i64)> = dis[i * 7..(i + 1) * 7]
                        .iter()
                        .copied()
                        .zip(labels[i * 7..(i + 1) * 7].iter().copied())
                        .collect();
                    assert_eq!(got, expect, "code size {cs}, {params:?}");
                }
            }
        }
    }

    #[test]
    fn padding_and_filter() {
        let db = [0u8, 1, 3, 7];
        let mut bits = Bitset::new(4);
        bits.set(0);
        bits.set(2);
        let (dis, labels) = knn_hamming(&[0], &db, 3, 1, bits.view()).unwrap();
        assert_eq!(labels, [1, 3, -1]);
        assert_eq!(dis, [1, 3, i32::MAX]);

        let (dis, labels) = knn(MetricType::Hamming, &[0], &db, 3, 1, bits.view()).unwrap();
        assert_eq!(labels, [1, 3, -1]);
        assert_eq!(dis, [1.0, 3.0, f32::INFINITY]);
    }

    #[test]
    fn jaccard_strategies_agree() {
        let db = random_codes(500, 16, 1);
        let queries = random_codes(4, 16, 2);
        let [a, b, c] = strategies().map(|p| {
            p.knn(MetricType::Jaccard, &queries, &db, 10, 16, BitsetView::empty())
                .unwrap()
        });
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(a.0.windows(2).take(9).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn structure_match_returns_first_hits_in_order() {
        // database entry j is the byte j; query 0x01 is contained in every odd byte
        let db: Vec<u8> = (0..=255u8).collect();
        for params in strategies() {
            let (dis, labels) = params
                .knn_match(MetricType::Substructure, &[0x01], &db, 4, 1, BitsetView::empty())
                .unwrap();
            assert_eq!(labels, [1, 3, 5, 7]);
            assert_eq!(dis, [0.0; 4]);

            let (dis, labels) = params
                .knn_match(MetricType::Superstructure, &[0x03], &db, 5, 1, BitsetView::empty())
                .unwrap();
            assert_eq!(labels, [0, 1, 2, 3, -1]);
            assert_eq!(dis[4], f32::INFINITY);
        }
    }

    #[test]
    fn tlsh_requires_digest_size() {
        let err = knn(MetricType::Tlsh, &[0; 8], &[0; 8], 1, 8, BitsetView::empty());
        assert!(matches!(err, Err(QuantError::UnsupportedMetric { .. })));

        let d = TlshDigest {
            checksum: 1,
            lvalue: 40,
            q1_ratio: 2,
            q2_ratio: 3,
            body: [0x1b; 32],
        };
        let mut far = d;
        far.lvalue = 60;
        let db: Vec<u8> = far.to_bytes().into_iter().chain(d.to_bytes()).collect();
        let (dis, labels) = knn(MetricType::Tlsh, &d.to_bytes(), &db, 2, 35, BitsetView::empty()).unwrap();
        assert_eq!(labels, [1, 0]);
        assert_eq!(dis[0], 0.0);
    }

    #[test]
    fn range_is_strict_and_empty_queries_stay_empty() {
        let db = [0x00u8, 0x01, 0x03, 0x07];
        let res = range_search(MetricType::Hamming, &[0x00, 0xF0], &db, 2.0, 1, BitsetView::empty())
            .unwrap();
        assert_eq!(res.query(0).0, &[0, 1]);
        assert!(res.query(1).0.is_empty());
        assert_eq!(res.lims, vec![0, 2, 2]);

        let res = range_search(MetricType::Jaccard, &[0xFF], &[0xFF, 0x0F], 0.6, 1, BitsetView::empty())
            .unwrap();
        assert_eq!(res.query(0), (&[0i64, 1][..], &[0.0f32, 0.5][..]));
    }

    #[test]
    fn unsupported_combinations() {
        let e = BitsetView::empty();
        assert!(matches!(
            range_search(MetricType::Substructure, &[0], &[0], 1.0, 1, e),
            Err(QuantError::UnsupportedMetric { .. })
        ));
        assert!(matches!(
            knn_match(MetricType::Hamming, &[0], &[0], 1, 1, e),
            Err(QuantError::UnsupportedMetric { .. })
        ));
        assert!(matches!(
            knn(MetricType::L2, &[0], &[0], 1, 1, e),
            Err(QuantError::UnsupportedMetric { .. })
        ));
        assert!(matches!(
            knn_hamming(&[0, 0], &[0, 0, 0], 1, 2, e),
            Err(QuantError::InvalidInput(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_strategies_agree(nb in 1usize..200, nq in 1usize..6, k in 1usize..12, seed in any::<u64>()) {
            let db = random_codes(nb, 8, seed);
            // few distinct values so ties are frequent
            let db: Vec<u8> = db.iter().map(|b| b & 0x11).collect();
            let queries = random_codes(nq, 8, seed ^ 0xABCD);
            let [a, b, _] = strategies().map(|p| {
                p.knn_hamming(&queries, &db, k, 8, BitsetView::empty()).unwrap()
            });
            prop_assert_eq!(a, b);
        }
    }
}
