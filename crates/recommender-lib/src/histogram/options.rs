//! Bucket layouts for decaying histograms
//!
//! Bucket boundaries are fixed when the options are built. The exponential
//! layout gives finer resolution at low usage values, which is where most
//! containers live.

use serde::{Deserialize, Serialize};

/// Default smallest weight that still counts as data.
pub const DEFAULT_EPSILON: f64 = 1e-4;

/// How bucket boundaries are laid out over `[0, max_value]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketScheme {
    /// Buckets of equal width.
    Linear { bucket_size: f64 },
    /// Bucket `n` has width `first_bucket_size * ratio^n`.
    Exponential { first_bucket_size: f64, ratio: f64 },
}

/// Immutable description of a histogram's buckets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramOptions {
    scheme: BucketScheme,
    max_value: f64,
    num_buckets: usize,
    epsilon: f64,
}

impl HistogramOptions {
    /// Equal-width buckets covering `[0, max_value]`.
    pub fn linear(max_value: f64, bucket_size: f64, epsilon: f64) -> Result<Self, String> {
        if !(max_value > 0.0 && bucket_size > 0.0) {
            return Err(format!(
                "max_value ({max_value}) and bucket_size ({bucket_size}) must be positive"
            ));
        }
        let num_buckets = (max_value / bucket_size).ceil() as usize + 1;
        Ok(Self {
            scheme: BucketScheme::Linear { bucket_size },
            max_value,
            num_buckets,
            epsilon,
        })
    }

    /// Geometrically growing buckets covering `[0, max_value]`.
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self, String> {
        if !(max_value > 0.0 && first_bucket_size > 0.0) {
            return Err(format!(
                "max_value ({max_value}) and first_bucket_size ({first_bucket_size}) must be positive"
            ));
        }
        if ratio <= 1.0 {
            return Err(format!("ratio must be greater than 1, got {ratio}"));
        }
        let num_buckets = ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln())
            .ceil() as usize
            + 1;
        Ok(Self {
            scheme: BucketScheme::Exponential {
                first_bucket_size,
                ratio,
            },
            max_value,
            num_buckets,
            epsilon,
        })
    }

    /// CPU usage in cores: 10 millicores up to 1000 cores, 5% growth.
    pub fn cpu_default() -> Self {
        Self {
            scheme: BucketScheme::Exponential {
                first_bucket_size: 0.01,
                ratio: 1.05,
            },
            max_value: 1000.0,
            num_buckets: exponential_bucket_count(1000.0, 0.01, 1.05),
            epsilon: DEFAULT_EPSILON,
        }
    }

    /// Memory usage in bytes: 10MB up to 1TB, 5% growth.
    pub fn memory_default() -> Self {
        Self {
            scheme: BucketScheme::Exponential {
                first_bucket_size: 1e7,
                ratio: 1.05,
            },
            max_value: 1e12,
            num_buckets: exponential_bucket_count(1e12, 1e7, 1.05),
            epsilon: DEFAULT_EPSILON,
        }
    }

    /// Replace the empty-weight threshold.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn scheme(&self) -> BucketScheme {
        self.scheme
    }

    /// Index of the bucket holding `value`. Values above the domain land in
    /// the last bucket, negative values in the first.
    pub fn find_bucket(&self, value: f64) -> usize {
        let bucket = match self.scheme {
            BucketScheme::Linear { bucket_size } => {
                if value <= 0.0 {
                    0
                } else {
                    (value / bucket_size) as usize
                }
            }
            BucketScheme::Exponential {
                first_bucket_size,
                ratio,
            } => {
                if value < first_bucket_size {
                    0
                } else {
                    ((value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln()) as usize
                }
            }
        };
        bucket.min(self.num_buckets - 1)
    }

    /// Lower boundary of `bucket`.
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        let bucket = bucket.min(self.num_buckets - 1);
        match self.scheme {
            BucketScheme::Linear { bucket_size } => bucket as f64 * bucket_size,
            BucketScheme::Exponential {
                first_bucket_size,
                ratio,
            } => {
                if bucket == 0 {
                    0.0
                } else {
                    first_bucket_size * (ratio.powi(bucket as i32) - 1.0) / (ratio - 1.0)
                }
            }
        }
    }

    /// Value reported for `bucket` by percentile queries: its upper edge.
    /// The last bucket is open-ended and reports its start.
    pub fn bucket_end(&self, bucket: usize) -> f64 {
        if bucket + 1 >= self.num_buckets {
            self.bucket_start(self.num_buckets - 1)
        } else {
            self.bucket_start(bucket + 1)
        }
    }
}

fn exponential_bucket_count(max_value: f64, first_bucket_size: f64, ratio: f64) -> usize {
    ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln()).ceil() as usize + 1
}
