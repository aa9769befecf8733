//! Usage bookkeeping for one container of one pod

use crate::models::Resources;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Highest memory usage seen inside one aggregation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPeak {
    pub bytes: f64,
    pub observed_at: DateTime<Utc>,
}

/// State of a single container instance.
///
/// Memory is not sampled straight into the aggregate: the container keeps
/// the peak of its current window and hands it over when the window closes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerState {
    pub requests: Resources,
    pub limits: Resources,
    memory_peak: Option<MemoryPeak>,
    window_end: Option<DateTime<Utc>>,
    last_cpu_sample: Option<DateTime<Utc>>,
    last_memory_sample: Option<DateTime<Utc>>,
    last_memory_usage: Option<f64>,
    last_oom: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn new(requests: Resources, limits: Resources) -> Self {
        Self {
            requests,
            limits,
            ..Default::default()
        }
    }

    /// Whether a CPU sample at `timestamp` is newer than every CPU sample
    /// already applied. Re-applied samples are not counted twice.
    pub fn accept_cpu_sample(&mut self, timestamp: DateTime<Utc>) -> bool {
        if self.last_cpu_sample.is_some_and(|last| timestamp <= last) {
            return false;
        }
        self.last_cpu_sample = Some(timestamp);
        true
    }

    /// Record a memory sample. Returns the peak of the previous window when
    /// this sample opens a new one.
    pub fn add_memory_sample(
        &mut self,
        bytes: f64,
        timestamp: DateTime<Utc>,
        interval: Duration,
    ) -> Option<MemoryPeak> {
        if self.last_memory_sample.is_some_and(|last| timestamp < last) {
            return None;
        }
        self.last_memory_sample = Some(timestamp);
        self.last_memory_usage = Some(bytes);

        // A window is never shorter than a millisecond.
        let step = chrono::Duration::from_std(interval)
            .unwrap_or(chrono::Duration::days(1))
            .num_milliseconds()
            .max(1);
        let interval = chrono::Duration::milliseconds(step);
        let sample = MemoryPeak {
            bytes,
            observed_at: timestamp,
        };

        match self.window_end {
            Some(end) if timestamp < end => {
                if self.memory_peak.map_or(true, |peak| bytes > peak.bytes) {
                    self.memory_peak = Some(sample);
                }
                None
            }
            Some(end) => {
                let behind = (timestamp - end).num_milliseconds();
                let windows = behind / step + 1;
                self.window_end = Some(end + chrono::Duration::milliseconds(windows * step));
                self.memory_peak.replace(sample)
            }
            None => {
                self.window_end = Some(timestamp + interval);
                self.memory_peak = Some(sample);
                None
            }
        }
    }

    /// Peak of the window that is still open.
    pub fn open_memory_peak(&self) -> Option<MemoryPeak> {
        self.memory_peak
    }

    /// Close the current window, handing over its peak.
    pub fn take_memory_peak(&mut self) -> Option<MemoryPeak> {
        self.window_end = None;
        self.memory_peak.take()
    }

    pub fn last_memory_usage(&self) -> Option<f64> {
        self.last_memory_usage
    }

    /// Whether an OOM kill finishing at `finished_at` has not been seen yet.
    pub fn accept_oom(&mut self, finished_at: DateTime<Utc>) -> bool {
        if self.last_oom.is_some_and(|last| finished_at <= last) {
            return false;
        }
        self.last_oom = Some(finished_at);
        true
    }

    pub fn last_sample(&self) -> Option<DateTime<Utc>> {
        self.last_cpu_sample.max(self.last_memory_sample)
    }
}
