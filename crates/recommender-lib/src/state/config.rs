//! Aggregation parameters shared by every component

use crate::histogram::{DecayingHistogram, HistogramOptions, DEFAULT_STALE_TOLERANCE};
use crate::models::{ResourceName, Resources};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 3600);
const MIB: f64 = 1024.0 * 1024.0;
/// Shortest window or half-life `normalized` lets through.
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// How much a single CPU usage sample counts in the CPU histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleWeighting {
    /// Every sample weighs 1.0.
    Uniform,
    /// A sample weighs the container's CPU request in cores, falling back
    /// to its limit, never less than `min_weight`.
    CpuAllocationProportional { min_weight: f64 },
}

impl Default for SampleWeighting {
    fn default() -> Self {
        SampleWeighting::CpuAllocationProportional { min_weight: 0.1 }
    }
}

impl SampleWeighting {
    pub fn cpu_weight(&self, requests: &Resources, limits: &Resources) -> f64 {
        match self {
            SampleWeighting::Uniform => 1.0,
            SampleWeighting::CpuAllocationProportional { min_weight } => {
                let allocation = requests
                    .get(&ResourceName::Cpu)
                    .filter(|amount| amount.0 > 0)
                    .or_else(|| limits.get(&ResourceName::Cpu))
                    .map(|amount| amount.to_usage(ResourceName::Cpu))
                    .unwrap_or(0.0);
                allocation.max(*min_weight)
            }
        }
    }

    /// Smallest weight any accepted sample can carry.
    pub fn min_weight(&self) -> f64 {
        match self {
            SampleWeighting::Uniform => 1.0,
            SampleWeighting::CpuAllocationProportional { min_weight } => *min_weight,
        }
    }
}

/// Parameters of the usage model, built once at startup and passed by
/// `Arc` into every component that needs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationsConfig {
    /// Length of one memory peak window.
    pub memory_aggregation_interval: Duration,
    /// Number of windows kept; the total history is interval × count.
    pub memory_aggregation_interval_count: u32,
    pub memory_histogram_decay_half_life: Duration,
    pub cpu_histogram_decay_half_life: Duration,
    pub cpu_histogram_options: HistogramOptions,
    pub memory_histogram_options: HistogramOptions,
    pub sample_weighting: SampleWeighting,
    /// How far behind the newest sample a late sample may still land.
    pub stale_sample_tolerance: Duration,
    /// Minimum absolute increase of the memory sample recorded for an OOM.
    pub oom_min_bump_up_bytes: f64,
    /// Minimum relative increase of the memory sample recorded for an OOM.
    pub oom_bump_up_ratio: f64,
    /// Weight of the memory sample recorded for an OOM.
    pub oom_sample_weight: f64,
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            memory_aggregation_interval: DAY,
            memory_aggregation_interval_count: 8,
            memory_histogram_decay_half_life: DAY,
            cpu_histogram_decay_half_life: DAY,
            cpu_histogram_options: HistogramOptions::cpu_default(),
            memory_histogram_options: HistogramOptions::memory_default(),
            sample_weighting: SampleWeighting::default(),
            stale_sample_tolerance: DEFAULT_STALE_TOLERANCE,
            oom_min_bump_up_bytes: 100.0 * MIB,
            oom_bump_up_ratio: 1.2,
            oom_sample_weight: 1.0,
        }
    }
}

impl AggregationsConfig {
    /// Keep histogram epsilons below the smallest sample weight so a single
    /// accepted sample is never mistaken for an empty histogram. Zero
    /// windows, counts and half-lives are raised to their minimum.
    pub fn normalized(mut self) -> Self {
        self.memory_aggregation_interval = self.memory_aggregation_interval.max(MIN_PERIOD);
        self.memory_aggregation_interval_count = self.memory_aggregation_interval_count.max(1);
        self.memory_histogram_decay_half_life =
            self.memory_histogram_decay_half_life.max(MIN_PERIOD);
        self.cpu_histogram_decay_half_life = self.cpu_histogram_decay_half_life.max(MIN_PERIOD);

        let min_weight = self
            .sample_weighting
            .min_weight()
            .min(self.oom_sample_weight)
            .min(1.0);
        let ceiling = min_weight * 0.01;
        if self.cpu_histogram_options.epsilon() > ceiling {
            self.cpu_histogram_options = self.cpu_histogram_options.with_epsilon(ceiling);
        }
        if self.memory_histogram_options.epsilon() > ceiling {
            self.memory_histogram_options = self.memory_histogram_options.with_epsilon(ceiling);
        }
        self
    }

    /// Total memory history: interval × count.
    pub fn memory_aggregation_window(&self) -> Duration {
        self.memory_aggregation_interval * self.memory_aggregation_interval_count
    }

    pub fn new_cpu_histogram(&self) -> DecayingHistogram {
        DecayingHistogram::new(
            self.cpu_histogram_options,
            self.cpu_histogram_decay_half_life,
        )
        .with_stale_tolerance(self.stale_sample_tolerance)
    }

    pub fn new_memory_histogram(&self) -> DecayingHistogram {
        DecayingHistogram::new(
            self.memory_histogram_options,
            self.memory_histogram_decay_half_life,
        )
        .with_stale_tolerance(self.memory_stale_tolerance())
    }

    /// Memory peaks are recorded when their window closes, so they may trail
    /// the newest peak of another pod by up to a full window.
    pub fn memory_stale_tolerance(&self) -> Duration {
        self.stale_sample_tolerance
            .max(self.memory_aggregation_interval)
    }

    /// Memory sample recorded for an OOM kill at `used` bytes.
    pub fn oom_bumped_memory(&self, used: f64) -> f64 {
        (used + self.oom_min_bump_up_bytes).max(used * self.oom_bump_up_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceAmount;

    fn cpu(millis: i64) -> Resources {
        let mut resources = Resources::new();
        resources.insert(ResourceName::Cpu, ResourceAmount(millis));
        resources
    }

    #[test]
    fn test_proportional_weight_prefers_request() {
        let weighting = SampleWeighting::default();
        assert_eq!(weighting.cpu_weight(&cpu(500), &cpu(2000)), 0.5);
        assert_eq!(weighting.cpu_weight(&Resources::new(), &cpu(2000)), 2.0);
        assert_eq!(weighting.cpu_weight(&cpu(10), &Resources::new()), 0.1);
        assert_eq!(weighting.cpu_weight(&Resources::new(), &Resources::new()), 0.1);
    }

    #[test]
    fn test_uniform_weight() {
        assert_eq!(SampleWeighting::Uniform.cpu_weight(&cpu(4000), &cpu(8000)), 1.0);
    }

    #[test]
    fn test_normalized_epsilon_below_min_weight() {
        let config = AggregationsConfig {
            sample_weighting: SampleWeighting::CpuAllocationProportional { min_weight: 0.001 },
            ..Default::default()
        }
        .normalized();
        assert!(config.cpu_histogram_options.epsilon() < 0.001);
        assert!(config.memory_histogram_options.epsilon() < 0.001);
    }

    #[test]
    fn test_normalized_raises_zero_periods() {
        let config = AggregationsConfig {
            memory_aggregation_interval: Duration::ZERO,
            memory_aggregation_interval_count: 0,
            memory_histogram_decay_half_life: Duration::ZERO,
            cpu_histogram_decay_half_life: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.memory_aggregation_interval, MIN_PERIOD);
        assert_eq!(config.memory_aggregation_interval_count, 1);
        assert_eq!(config.memory_histogram_decay_half_life, MIN_PERIOD);
        assert_eq!(config.cpu_histogram_decay_half_life, MIN_PERIOD);
        assert_eq!(config.memory_aggregation_window(), MIN_PERIOD);
    }

    #[test]
    fn test_normalized_keeps_valid_periods() {
        let config = AggregationsConfig::default().normalized();
        assert_eq!(config.memory_aggregation_interval, DAY);
        assert_eq!(config.cpu_histogram_decay_half_life, DAY);
    }

    #[test]
    fn test_oom_bump_up() {
        let config = AggregationsConfig::default();
        // Small containers get the absolute bump.
        assert_eq!(config.oom_bumped_memory(100.0 * MIB), 200.0 * MIB);
        // Large containers get the relative one.
        let used = 4096.0 * MIB;
        assert_eq!(config.oom_bumped_memory(used), used * 1.2);
    }

    #[test]
    fn test_memory_window() {
        let config = AggregationsConfig::default();
        assert_eq!(config.memory_aggregation_window(), DAY * 8);
    }
}
