//! Usage model of one container across all pods of a workload

use super::config::AggregationsConfig;
use super::container::ContainerState;
use crate::checkpoint::{ContainerCheckpoint, CHECKPOINT_VERSION};
use crate::error::{CheckpointError, HistogramError};
use crate::histogram::DecayingHistogram;
use crate::models::{ResourceName, Resources};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// CPU and memory histograms plus sample bookkeeping for one
/// (workload, container) pair.
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    config: Arc<AggregationsConfig>,
    cpu: DecayingHistogram,
    memory: DecayingHistogram,
    created_at: DateTime<Utc>,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    total_samples_count: u64,
    last_requests: Resources,
    last_limits: Resources,
    autoscaled: bool,
}

impl AggregateContainerState {
    pub fn new(config: Arc<AggregationsConfig>, created_at: DateTime<Utc>) -> Self {
        Self {
            cpu: config.new_cpu_histogram(),
            memory: config.new_memory_histogram(),
            config,
            created_at,
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            last_requests: Resources::new(),
            last_limits: Resources::new(),
            autoscaled: true,
        }
    }

    /// Remember the allocation of the newest observed container instance.
    pub fn update_allocation(&mut self, requests: &Resources, limits: &Resources) {
        self.last_requests = requests.clone();
        self.last_limits = limits.clone();
    }

    pub fn last_requests(&self) -> &Resources {
        &self.last_requests
    }

    pub fn last_limits(&self) -> &Resources {
        &self.last_limits
    }

    /// Add one observation. CPU values are usage in cores weighted by the
    /// configured sample weighting; memory values are window peaks in bytes.
    pub fn add_sample(
        &mut self,
        resource: ResourceName,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        match resource {
            ResourceName::Cpu => {
                let weight = self.cpu_sample_weight();
                self.cpu.add_sample(value, weight, timestamp)?;
                self.total_samples_count += 1;
                self.touch(timestamp);
                Ok(())
            }
            ResourceName::Memory => self.add_memory_peak(value, timestamp),
        }
    }

    /// Weight a CPU sample gets under the current allocation.
    pub fn cpu_sample_weight(&self) -> f64 {
        self.config
            .sample_weighting
            .cpu_weight(&self.last_requests, &self.last_limits)
    }

    /// Add the peak memory usage of one closed window.
    pub fn add_memory_peak(
        &mut self,
        bytes: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        self.memory.add_sample(bytes, 1.0, timestamp)?;
        self.touch(timestamp);
        Ok(())
    }

    /// Record an OOM kill of a container that was using `used_bytes`.
    pub fn record_oom(
        &mut self,
        used_bytes: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        let bumped = self.config.oom_bumped_memory(used_bytes);
        self.memory
            .add_sample(bumped, self.config.oom_sample_weight, timestamp)?;
        self.touch(timestamp);
        Ok(())
    }

    /// Fold the open memory window of a terminating container instance.
    pub fn fold_terminated_instance(
        &mut self,
        container: &mut ContainerState,
        now: DateTime<Utc>,
    ) -> Result<(), HistogramError> {
        match container.take_memory_peak() {
            Some(peak) => {
                let at = self
                    .memory
                    .reference_timestamp()
                    .map_or(now, |reference| reference.max(now));
                self.add_memory_peak(peak.bytes, at)
            }
            None => Ok(()),
        }
    }

    pub fn mark_not_autoscaled(&mut self) {
        self.autoscaled = false;
    }

    pub fn mark_autoscaled(&mut self) {
        self.autoscaled = true;
    }

    pub fn is_autoscaled(&self) -> bool {
        self.autoscaled
    }

    /// Combine another aggregate of the same container into this one.
    pub fn merge(&mut self, other: &AggregateContainerState) -> Result<(), HistogramError> {
        self.cpu.merge(&other.cpu)?;
        self.memory.merge(&other.memory)?;
        self.first_sample_start = match (self.first_sample_start, other.first_sample_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_sample_start = self.last_sample_start.max(other.last_sample_start);
        self.total_samples_count += other.total_samples_count;
        self.created_at = self.created_at.min(other.created_at);
        Ok(())
    }

    /// How much the histograms can be trusted, in days of data: the smaller
    /// of the observed lifespan and the sample count at one per minute.
    pub fn confidence(&self) -> f64 {
        let lifespan_days = match (self.first_sample_start, self.last_sample_start) {
            (Some(first), Some(last)) => {
                (last - first).num_seconds().max(0) as f64 / (24.0 * 3600.0)
            }
            _ => 0.0,
        };
        let samples_days = self.total_samples_count as f64 / (60.0 * 24.0);
        lifespan_days.min(samples_days)
    }

    pub fn cpu_histogram(&self) -> &DecayingHistogram {
        &self.cpu
    }

    pub fn memory_histogram(&self) -> &DecayingHistogram {
        &self.memory
    }

    pub fn total_samples_count(&self) -> u64 {
        self.total_samples_count
    }

    pub fn first_sample_start(&self) -> Option<DateTime<Utc>> {
        self.first_sample_start
    }

    pub fn last_sample_start(&self) -> Option<DateTime<Utc>> {
        self.last_sample_start
    }

    /// Whether neither histogram holds any data.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }

    /// No sample (or, without samples, no creation) inside the memory
    /// aggregation window ending at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.config.memory_aggregation_window())
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let last_activity = self.last_sample_start.unwrap_or(self.created_at);
        now - last_activity > window
    }

    pub fn save_to_checkpoint(&self, now: DateTime<Utc>) -> ContainerCheckpoint {
        ContainerCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            last_update_time: now,
            cpu_histogram: self.cpu.save_to_checkpoint(),
            memory_histogram: self.memory.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
        }
    }

    /// Rebuild an aggregate by merging the checkpointed histograms into
    /// fresh ones built from the current configuration.
    pub fn load_from_checkpoint(
        config: Arc<AggregationsConfig>,
        checkpoint: &ContainerCheckpoint,
    ) -> Result<Self, CheckpointError> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: checkpoint.version.clone(),
                expected: CHECKPOINT_VERSION.to_string(),
            });
        }
        let cpu = DecayingHistogram::load_from_checkpoint(
            config.cpu_histogram_options,
            config.cpu_histogram_decay_half_life,
            &checkpoint.cpu_histogram,
        )?;
        let memory = DecayingHistogram::load_from_checkpoint(
            config.memory_histogram_options,
            config.memory_histogram_decay_half_life,
            &checkpoint.memory_histogram,
        )?;

        let created_at = checkpoint
            .first_sample_start
            .unwrap_or(checkpoint.last_update_time);
        let mut state = Self::new(config, created_at);
        state.cpu.merge(&cpu)?;
        state.memory.merge(&memory)?;
        state.first_sample_start = checkpoint.first_sample_start;
        state.last_sample_start = checkpoint.last_sample_start;
        state.total_samples_count = checkpoint.total_samples_count;
        Ok(state)
    }

    fn touch(&mut self, timestamp: DateTime<Utc>) {
        if self.first_sample_start.map_or(true, |first| timestamp < first) {
            self.first_sample_start = Some(timestamp);
        }
        if self.last_sample_start.map_or(true, |last| timestamp > last) {
            self.last_sample_start = Some(timestamp);
        }
    }
}
