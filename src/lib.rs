//! quantscan: the quantization and search core of an approximate nearest neighbor index.
//!
//! Trains codebooks over float vectors, encodes vectors into compact byte codes, and
//! scans code databases at high throughput:
//!
//! - `clustering/`: k-means (random or k-means++ seeding, split of empty clusters,
//!   spherical and integer centroids) and progressive-dimension k-means
//! - `residual/`: residual quantizer trained and encoded with beam search
//! - `fastscan/`: 4-bit product-quantization scan in SIMD registers
//! - `binary/`: exact KNN / range search over binary codes (Hamming, Jaccard,
//!   sub/superstructure, TLSH)
//! - `simd`, `distance`, `heap`, `range`, `filtering`: the primitives everything above
//!   is built on
//! - `io`: sector-aligned block reads for disk-resident code databases
//!
//! # Critical Nuances
//!
//! ## Ties Are Broken by Id
//!
//! Top-k heaps order candidates by `(value, id)`. Multi-threaded scans merge partial
//! heaps, and this is what keeps their output identical to a single-threaded scan.
//!
//! ## Fast-Scan Distances Are Quantized
//!
//! The 4-bit scan accumulates `u8` lookup tables into wrapping `u16` sums. A table
//! quantized with [`fastscan::quantize_lut`] maps a sum `s` back to `b + s / a`; sums
//! overflow when `nsq * 255` exceeds `u16::MAX`, so very long codes need coarser tables.
//!
//! ## Clustering Needs Enough Points
//!
//! Below `k * min_points_per_centroid` training points k-means still runs but the
//! centroids are poorly constrained; above `k * max_points_per_centroid` the training set
//! is subsampled. Both are logged.

pub mod binary;
pub mod clustering;
pub mod distance;
pub mod error;
pub mod fastscan;
pub mod filtering;
pub mod flat;
pub mod heap;
pub mod interrupt;
pub mod io;
pub mod metric;
pub mod range;
pub mod residual;
pub mod simd;

// Re-exports
pub use clustering::{Clustering, ClusteringParameters, ClusteringType};
pub use error::{QuantError, Result};
pub use filtering::{Bitset, BitsetView};
pub use flat::{AssignIndex, FlatIndex};
pub use metric::MetricType;
pub use range::RangeSearchResult;
pub use residual::ResidualQuantizer;
