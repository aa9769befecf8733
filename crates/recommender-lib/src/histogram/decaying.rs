//! Weighted frequency model with exponential time decay
//!
//! Every bucket weight is decayed by `2^(-Δt / half_life)` before a new
//! sample lands, so the total weight converges under a steady sampling
//! rate instead of growing without bound.

use super::options::HistogramOptions;
use crate::error::HistogramError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default window inside which late samples are still accepted.
pub const DEFAULT_STALE_TOLERANCE: Duration = Duration::from_secs(10 * 60);

/// Serializable form of a [`DecayingHistogram`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    pub reference_timestamp: Option<DateTime<Utc>>,
    /// Non-empty buckets only, keyed by bucket index.
    pub bucket_weights: BTreeMap<u32, f64>,
    pub total_weight: f64,
}

/// Histogram whose bucket weights lose half their value every `half_life`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayingHistogram {
    options: HistogramOptions,
    half_life: Duration,
    stale_tolerance: Duration,
    bucket_weights: Vec<f64>,
    /// Time up to which all bucket weights have been decayed.
    reference_timestamp: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        Self {
            options,
            half_life,
            stale_tolerance: DEFAULT_STALE_TOLERANCE,
            bucket_weights: vec![0.0; options.num_buckets()],
            reference_timestamp: None,
        }
    }

    pub fn with_stale_tolerance(mut self, tolerance: Duration) -> Self {
        self.stale_tolerance = tolerance;
        self
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn reference_timestamp(&self) -> Option<DateTime<Utc>> {
        self.reference_timestamp
    }

    /// Sum of all bucket weights.
    pub fn total_weight(&self) -> f64 {
        self.bucket_weights.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight() < self.options.epsilon()
    }

    /// Deposit `weight` into the bucket holding `value`.
    ///
    /// Samples at or after the reference timestamp decay the existing weights
    /// first. Samples up to `stale_tolerance` older than the reference are
    /// accepted with their weight decayed by their age; older ones are
    /// rejected and leave the histogram untouched.
    pub fn add_sample(
        &mut self,
        value: f64,
        weight: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        if !value.is_finite() || value < 0.0 {
            return Err(HistogramError::InvalidValue(value));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(HistogramError::InvalidWeight(weight));
        }

        let mut weight = weight;
        match self.reference_timestamp {
            Some(reference) if timestamp < reference => {
                let age = reference - timestamp;
                if age.to_std().unwrap_or(Duration::MAX) > self.stale_tolerance {
                    return Err(HistogramError::StaleSample {
                        timestamp,
                        reference,
                    });
                }
                weight *= self.decay_factor(age);
            }
            _ => self.decay_to(timestamp),
        }

        if weight == 0.0 {
            return Ok(());
        }
        let bucket = self.options.find_bucket(value);
        self.bucket_weights[bucket] += weight;
        Ok(())
    }

    /// Decay all weights up to `timestamp`. Never moves the reference back.
    pub fn decay_to(&mut self, timestamp: DateTime<Utc>) {
        let reference = match self.reference_timestamp {
            None => {
                self.reference_timestamp = Some(timestamp);
                return;
            }
            Some(reference) => reference,
        };
        if timestamp <= reference {
            return;
        }

        let factor = self.decay_factor(timestamp - reference);
        for weight in self.bucket_weights.iter_mut() {
            *weight *= factor;
            if *weight < f64::MIN_POSITIVE {
                *weight = 0.0;
            }
        }
        self.reference_timestamp = Some(timestamp);
    }

    /// Smallest bucket upper edge whose cumulative weight fraction reaches
    /// `percentile`. `None` when the histogram holds no data.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let percentile = percentile.clamp(0.0, 1.0);
        let threshold = percentile * self.total_weight();

        let mut cumulative = 0.0;
        let mut last_non_empty = 0;
        for (bucket, weight) in self.bucket_weights.iter().enumerate() {
            if *weight <= 0.0 {
                continue;
            }
            cumulative += weight;
            last_non_empty = bucket;
            if cumulative >= threshold {
                return Some(self.options.bucket_end(bucket));
            }
        }
        Some(self.options.bucket_end(last_non_empty))
    }

    /// Combine `other` into `self` bucket-wise after aligning both to the
    /// later of the two reference timestamps.
    pub fn merge(&mut self, other: &DecayingHistogram) -> Result<(), HistogramError> {
        if other.options != self.options {
            return Err(HistogramError::IncompatibleLayout);
        }
        let Some(other_reference) = other.reference_timestamp else {
            return Ok(());
        };

        let target = match self.reference_timestamp {
            Some(reference) => reference.max(other_reference),
            None => other_reference,
        };
        self.decay_to(target);

        let factor = if target > other_reference {
            self.decay_factor(target - other_reference)
        } else {
            1.0
        };
        for (mine, theirs) in self.bucket_weights.iter_mut().zip(&other.bucket_weights) {
            *mine += theirs * factor;
        }
        Ok(())
    }

    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let bucket_weights: BTreeMap<u32, f64> = self
            .bucket_weights
            .iter()
            .enumerate()
            .filter(|(_, weight)| **weight > 0.0)
            .map(|(bucket, weight)| (bucket as u32, *weight))
            .collect();
        HistogramCheckpoint {
            reference_timestamp: self.reference_timestamp,
            total_weight: bucket_weights.values().sum(),
            bucket_weights,
        }
    }

    /// Rebuild a histogram from its checkpoint. Bucket indices outside the
    /// configured layout and non-finite weights are rejected.
    pub fn load_from_checkpoint(
        options: HistogramOptions,
        half_life: Duration,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<Self, HistogramError> {
        let mut histogram = Self::new(options, half_life);
        for (bucket, weight) in &checkpoint.bucket_weights {
            let bucket = *bucket as usize;
            if bucket >= options.num_buckets() {
                return Err(HistogramError::BucketOutOfRange {
                    bucket,
                    num_buckets: options.num_buckets(),
                });
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(HistogramError::InvalidWeight(*weight));
            }
            histogram.bucket_weights[bucket] = *weight;
        }
        histogram.reference_timestamp = checkpoint.reference_timestamp;
        Ok(histogram)
    }

    fn decay_factor(&self, elapsed: chrono::Duration) -> f64 {
        let elapsed_secs = elapsed.num_milliseconds() as f64 / 1000.0;
        let half_life_secs = self.half_life.as_secs_f64();
        if half_life_secs <= 0.0 {
            return 0.0;
        }
        (-elapsed_secs / half_life_secs).exp2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::options::DEFAULT_EPSILON;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn linear() -> HistogramOptions {
        HistogramOptions::linear(100.0, 1.0, DEFAULT_EPSILON).unwrap()
    }

    #[test]
    fn test_empty_histogram_has_no_percentile() {
        let histogram = DecayingHistogram::new(linear(), HOUR);
        assert!(histogram.is_empty());
        assert_eq!(histogram.percentile(0.5), None);
    }

    #[test]
    fn test_percentile_returns_upper_bucket_edge() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        for value in [1.5, 2.5, 3.5, 4.5] {
            histogram.add_sample(value, 1.0, start()).unwrap();
        }
        assert_eq!(histogram.percentile(0.0), Some(2.0));
        assert_eq!(histogram.percentile(0.5), Some(3.0));
        assert_eq!(histogram.percentile(0.75), Some(4.0));
        assert_eq!(histogram.percentile(1.0), Some(5.0));
    }

    #[test]
    fn test_sample_weight_halves_after_half_life() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        histogram.add_sample(10.0, 4.0, start()).unwrap();
        histogram.decay_to(start() + chrono::Duration::hours(1));
        assert!((histogram.total_weight() - 2.0).abs() < 1e-12);
        histogram.decay_to(start() + chrono::Duration::hours(3));
        assert!((histogram.total_weight() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_recent_samples_dominate_old_ones() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        histogram.add_sample(10.0, 1.0, start()).unwrap();
        histogram
            .add_sample(50.0, 1.0, start() + chrono::Duration::hours(10))
            .unwrap();
        // The old sample weighs ~1/1024 of the new one.
        assert_eq!(histogram.percentile(0.5), Some(51.0));
    }

    #[test]
    fn test_decay_by_zero_elapsed_time_is_noop() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        histogram.add_sample(3.0, 2.0, start()).unwrap();
        let before = histogram.clone();
        histogram.decay_to(start());
        assert_eq!(histogram, before);
    }

    #[test]
    fn test_stale_sample_rejected_without_side_effects() {
        let mut histogram =
            DecayingHistogram::new(linear(), HOUR).with_stale_tolerance(Duration::from_secs(60));
        histogram
            .add_sample(3.0, 1.0, start() + chrono::Duration::hours(1))
            .unwrap();
        let before = histogram.clone();

        let result = histogram.add_sample(80.0, 1.0, start());
        assert!(matches!(result, Err(HistogramError::StaleSample { .. })));
        assert_eq!(histogram, before);
    }

    #[test]
    fn test_late_sample_within_tolerance_is_age_decayed() {
        let mut histogram =
            DecayingHistogram::new(linear(), HOUR).with_stale_tolerance(Duration::from_secs(7200));
        histogram
            .add_sample(3.0, 1.0, start() + chrono::Duration::hours(1))
            .unwrap();
        histogram.add_sample(3.0, 1.0, start()).unwrap();
        assert!((histogram.total_weight() - 1.5).abs() < 1e-12);
        assert_eq!(
            histogram.reference_timestamp(),
            Some(start() + chrono::Duration::hours(1))
        );
    }

    #[test]
    fn test_invalid_samples_rejected() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        assert!(histogram.add_sample(f64::NAN, 1.0, start()).is_err());
        assert!(histogram.add_sample(-1.0, 1.0, start()).is_err());
        assert!(histogram.add_sample(1.0, -2.0, start()).is_err());
        assert!(histogram.is_empty());
    }

    #[test]
    fn test_outlier_clamped_to_last_bucket() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        histogram.add_sample(1e9, 1.0, start()).unwrap();
        assert_eq!(histogram.percentile(1.0), Some(histogram.options().max_value()));
    }

    #[test]
    fn test_merge_aligns_reference_timestamps() {
        let mut older = DecayingHistogram::new(linear(), HOUR);
        older.add_sample(5.0, 2.0, start()).unwrap();
        let mut newer = DecayingHistogram::new(linear(), HOUR);
        newer
            .add_sample(7.0, 1.0, start() + chrono::Duration::hours(1))
            .unwrap();

        let mut merged = older.clone();
        merged.merge(&newer).unwrap();
        assert_eq!(
            merged.reference_timestamp(),
            Some(start() + chrono::Duration::hours(1))
        );
        // 2.0 decayed by one half-life plus 1.0.
        assert!((merged.total_weight() - 2.0).abs() < 1e-12);

        let mut reversed = newer.clone();
        reversed.merge(&older).unwrap();
        assert_eq!(merged, reversed);
    }

    #[test]
    fn test_merge_into_empty_adopts_other() {
        let mut histogram = DecayingHistogram::new(linear(), HOUR);
        histogram.add_sample(9.0, 1.0, start()).unwrap();
        let mut fresh = DecayingHistogram::new(linear(), HOUR);
        fresh.merge(&histogram).unwrap();
        assert_eq!(fresh, histogram);
    }

    #[test]
    fn test_merge_rejects_different_layouts() {
        let mut a = DecayingHistogram::new(linear(), HOUR);
        let b = DecayingHistogram::new(HistogramOptions::cpu_default(), HOUR);
        assert_eq!(a.merge(&b), Err(HistogramError::IncompatibleLayout));
    }

    #[test]
    fn test_checkpoint_round_trip_is_exact() {
        let mut histogram = DecayingHistogram::new(HistogramOptions::cpu_default(), HOUR);
        for (minute, value) in [(0, 0.1), (1, 0.25), (2, 1.7), (3, 0.1)] {
            histogram
                .add_sample(value, 0.5, start() + chrono::Duration::minutes(minute))
                .unwrap();
        }
        let checkpoint = histogram.save_to_checkpoint();
        let restored =
            DecayingHistogram::load_from_checkpoint(*histogram.options(), HOUR, &checkpoint)
                .unwrap();
        assert_eq!(restored, histogram);
        for p in [0.0, 0.5, 0.9, 1.0] {
            assert_eq!(restored.percentile(p), histogram.percentile(p));
        }
    }

    #[test]
    fn test_checkpoint_with_foreign_bucket_rejected() {
        let mut checkpoint = DecayingHistogram::new(linear(), HOUR).save_to_checkpoint();
        checkpoint.bucket_weights.insert(5000, 1.0);
        let result = DecayingHistogram::load_from_checkpoint(linear(), HOUR, &checkpoint);
        assert!(matches!(result, Err(HistogramError::BucketOutOfRange { .. })));
    }

    proptest! {
        #[test]
        fn prop_total_weight_bounded_by_steady_state(
            values in proptest::collection::vec(0.0f64..200.0, 1..300),
            step_secs in 1i64..3600,
        ) {
            let half_life = HOUR;
            let mut histogram = DecayingHistogram::new(linear(), half_life);
            for (i, value) in values.iter().enumerate() {
                let at = start() + chrono::Duration::seconds(step_secs * i as i64);
                histogram.add_sample(*value, 1.0, at).unwrap();
            }
            let per_step = (-(step_secs as f64) / half_life.as_secs_f64()).exp2();
            let bound = 1.0 / (1.0 - per_step);
            prop_assert!(histogram.total_weight() <= bound * (1.0 + 1e-9));
        }

        #[test]
        fn prop_max_percentile_tracks_max_value(
            values in proptest::collection::vec(0.0f64..99.0, 1..100),
        ) {
            let mut histogram = DecayingHistogram::new(linear(), HOUR);
            let mut previous = 0.0;
            let mut max_seen: f64 = 0.0;
            for value in values {
                histogram.add_sample(value, 1.0, start()).unwrap();
                max_seen = max_seen.max(value);
                let p100 = histogram.percentile(1.0).unwrap();
                prop_assert!(p100 >= previous);
                prop_assert_eq!(p100, histogram.options().bucket_end(histogram.options().find_bucket(max_seen)));
                previous = p100;
            }
        }

        #[test]
        fn prop_merge_commutative_and_associative(
            a in proptest::collection::vec((0.0f64..99.0, 0.1f64..5.0), 0..30),
            b in proptest::collection::vec((0.0f64..99.0, 0.1f64..5.0), 0..30),
            c in proptest::collection::vec((0.0f64..99.0, 0.1f64..5.0), 0..30),
        ) {
            let build = |samples: &[(f64, f64)]| {
                let mut histogram = DecayingHistogram::new(linear(), HOUR);
                histogram.decay_to(start());
                for (value, weight) in samples {
                    histogram.add_sample(*value, *weight, start()).unwrap();
                }
                histogram
            };
            let (ha, hb, hc) = (build(&a), build(&b), build(&c));

            let mut ab = ha.clone();
            ab.merge(&hb).unwrap();
            let mut ba = hb.clone();
            ba.merge(&ha).unwrap();
            prop_assert_eq!(&ab, &ba);

            let mut ab_c = ab.clone();
            ab_c.merge(&hc).unwrap();
            let mut bc = hb.clone();
            bc.merge(&hc).unwrap();
            let mut a_bc = ha.clone();
            a_bc.merge(&bc).unwrap();
            for (x, y) in ab_c.bucket_weights.iter().zip(&a_bc.bucket_weights) {
                prop_assert!((x - y).abs() <= 1e-9 * (1.0 + x.abs()));
            }
        }
    }
}
