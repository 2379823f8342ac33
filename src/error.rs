//! Error types for quantscan.

use thiserror::Error;

use crate::metric::MetricType;

/// Errors raised by training, encoding and search entry points.
///
/// Every variant is produced while validating arguments, before any work starts,
/// so a caller never observes a partially written result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantError {
    /// Invalid parameter or parameter combination.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Codec / index / data dimensionality disagreement.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Input data that cannot be processed (e.g. NaN or Inf in training vectors).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Buffer or length not aligned to what a vectorized path requires.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// No specialized or generic path for this metric / code size combination.
    #[error("unsupported metric {metric:?} for code size {code_size}")]
    UnsupportedMetric { metric: MetricType, code_size: usize },

    /// Failure reported by a block reader.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for QuantError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuantError>;

/// Fail with [`QuantError::DimensionMismatch`] unless `actual == expected`.
#[inline]
pub(crate) fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(QuantError::DimensionMismatch { expected, actual });
    }
    Ok(())
}
