//! Metric identifiers.
//!
//! The metric decides the comparator direction everywhere: inner product keeps the
//! largest values, every other metric keeps the smallest.

use serde::{Deserialize, Serialize};

/// Metric used to compare vectors or binary codes.
///
/// Discriminants are stable and match the on-wire identifiers used by index layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MetricType {
    /// Maximum inner product search.
    InnerProduct = 0,
    /// Squared Euclidean distance.
    L2 = 1,
    /// L1 (cityblock) distance.
    L1 = 2,
    /// L-infinity (Chebyshev) distance.
    Linf = 3,
    /// L_p distance; `p` is passed separately as the metric argument.
    Lp = 4,
    /// Jaccard distance (binary codes) or weighted Jaccard (floats).
    Jaccard = 5,
    /// Hamming distance between binary codes.
    Hamming = 7,
    /// Query is a substructure of the database code (Tversky alpha = 0, beta = 1).
    Substructure = 8,
    /// Query is a superstructure of the database code (Tversky alpha = 1, beta = 0).
    Superstructure = 9,
    /// Canberra distance.
    Canberra = 20,
    /// Bray-Curtis dissimilarity.
    BrayCurtis = 21,
    /// Jensen-Shannon divergence.
    JensenShannon = 22,
    /// Trend Micro locality sensitive hash distance over fixed 35-byte digests.
    Tlsh = 99,
}

impl MetricType {
    /// Whether larger values are better (similarity) for this metric.
    #[inline]
    #[must_use]
    pub fn is_similarity(self) -> bool {
        matches!(self, MetricType::InnerProduct)
    }

    /// Whether the metric applies to binary codes rather than float vectors.
    #[inline]
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            MetricType::Jaccard
                | MetricType::Hamming
                | MetricType::Substructure
                | MetricType::Superstructure
                | MetricType::Tlsh
        )
    }

    /// Metrics that answer "does it match" instead of "how far": every hit has distance 0.
    #[inline]
    #[must_use]
    pub fn is_structure(self) -> bool {
        matches!(self, MetricType::Substructure | MetricType::Superstructure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction() {
        assert!(MetricType::InnerProduct.is_similarity());
        assert!(!MetricType::L2.is_similarity());
        assert!(!MetricType::Hamming.is_similarity());
    }

    #[test]
    fn binary_family() {
        assert!(MetricType::Tlsh.is_binary());
        assert!(MetricType::Substructure.is_structure());
        assert!(!MetricType::L1.is_binary());
        assert_eq!(MetricType::Tlsh as u32, 99);
    }
}
