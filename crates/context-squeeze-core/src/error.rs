//! Error taxonomy shared by the core and application crates.
//!
//! Only unusable input or configuration surfaces as an error to the caller.
//! Per-chunk failures (rating anomalies, failed shrink calls, cache
//! corruption) are absorbed where they happen and show up in the final
//! [`CompressionStats`](crate::models::CompressionStats) instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqueezeError {
    /// The document cannot be split safely, e.g. an unterminated code fence.
    #[error("structural error at line {line}: {message}")]
    Structural { line: usize, message: String },

    /// Reduction fraction outside the open interval (0, 1).
    #[error("invalid reduction fraction {0}: must be in the open interval (0, 1)")]
    InvalidReduction(f64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SqueezeError>;
