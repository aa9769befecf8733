//! Error types shared across the recommender engine

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised at the histogram boundary.
///
/// A rejected sample never modifies the histogram.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistogramError {
    #[error("sample at {timestamp} is older than reference {reference} beyond tolerance")]
    StaleSample {
        timestamp: DateTime<Utc>,
        reference: DateTime<Utc>,
    },

    #[error("invalid sample value: {0}")]
    InvalidValue(f64),

    #[error("invalid sample weight: {0}")]
    InvalidWeight(f64),

    #[error("bucket {bucket} out of range for histogram with {num_buckets} buckets")]
    BucketOutOfRange { bucket: usize, num_buckets: usize },

    #[error("histograms have different bucket layouts")]
    IncompatibleLayout,
}

/// Errors raised when a usage sample cannot be applied to the cluster state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("pod {0} is not tracked")]
    UnknownPod(String),

    #[error("container {container} is not part of pod {pod}")]
    UnknownContainer { pod: String, container: String },

    #[error("sample rejected: {0}")]
    Rejected(#[from] HistogramError),
}

/// Errors raised by checkpoint stores and checkpoint decoding.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported checkpoint version {found}, expected {expected}")]
    VersionMismatch { found: String, expected: String },

    #[error("invalid histogram in checkpoint: {0}")]
    Histogram(#[from] HistogramError),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors raised when writing a recommendation back to a workload status.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The workload was modified concurrently; re-read and retry.
    #[error("conflicting update of workload {0}")]
    Conflict(String),

    #[error("workload {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
