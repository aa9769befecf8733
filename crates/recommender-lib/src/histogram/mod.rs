//! Bounded-memory usage distributions
//!
//! A [`DecayingHistogram`] keeps one weight per fixed bucket and lets old
//! samples fade with a configurable half-life.

mod decaying;
mod options;

pub use decaying::{DecayingHistogram, HistogramCheckpoint, DEFAULT_STALE_TOLERANCE};
pub use options::{BucketScheme, HistogramOptions, DEFAULT_EPSILON};
