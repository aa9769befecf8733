//! Collaborators the feeder reads from

use crate::models::{ContainerUsageSample, PodId, PodSpec, WorkloadSpec};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Orchestrator objects: workloads and pods.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Every workload in scope, whichever recommender it names.
    async fn list_workloads(&self) -> Result<Vec<WorkloadSpec>>;

    async fn list_pods(&self) -> Result<Vec<PodSpec>>;
}

/// Live per-container usage.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Usage observed since the previous call, CPU in cores, memory in bytes.
    async fn container_usage(&self) -> Result<Vec<ContainerUsageSample>>;
}

/// Usage history of one pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodHistory {
    pub labels: BTreeMap<String, String>,
    /// Samples per container name.
    pub samples: BTreeMap<String, Vec<ContainerUsageSample>>,
}

impl PodHistory {
    pub fn sample_count(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    pub fn last_sample(&self) -> Option<DateTime<Utc>> {
        self.samples
            .values()
            .flat_map(|samples| samples.iter().map(|s| s.timestamp))
            .max()
    }
}

/// Usage history of every pod a time-series source knows about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterHistory {
    pub pods: BTreeMap<PodId, PodHistory>,
}

impl ClusterHistory {
    pub fn sample_count(&self) -> usize {
        self.pods.values().map(PodHistory::sample_count).sum()
    }

    /// Every sample of every pod, oldest first.
    pub fn samples_in_order(&self) -> Vec<&ContainerUsageSample> {
        let mut samples: Vec<&ContainerUsageSample> = self
            .pods
            .values()
            .flat_map(|pod| pod.samples.values().flatten())
            .collect();
        samples.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.pod.cmp(&b.pod))
                .then_with(|| a.container.cmp(&b.container))
        });
        samples
    }
}

/// Time-series source queried once at startup.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn cluster_history(&self) -> Result<ClusterHistory>;
}
