//! In-memory sources for tests

use super::source::{ClusterHistory, ClusterSource, HistoryProvider, MetricsSource};
use crate::models::{ContainerUsageSample, PodSpec, WorkloadSpec};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Mutex;

/// Cluster objects set by the test. A source marked failing errors on every
/// listing until cleared.
#[derive(Default)]
pub struct FakeCluster {
    pub workloads: Mutex<Vec<WorkloadSpec>>,
    pub pods: Mutex<Vec<PodSpec>>,
    pub fail_workloads: Mutex<bool>,
    pub fail_pods: Mutex<bool>,
}

impl FakeCluster {
    pub fn set_workloads(&self, workloads: Vec<WorkloadSpec>) {
        *self.workloads.lock().unwrap() = workloads;
    }

    pub fn set_pods(&self, pods: Vec<PodSpec>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn fail_workload_listing(&self, fail: bool) {
        *self.fail_workloads.lock().unwrap() = fail;
    }

    pub fn fail_pod_listing(&self, fail: bool) {
        *self.fail_pods.lock().unwrap() = fail;
    }
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn list_workloads(&self) -> Result<Vec<WorkloadSpec>> {
        if *self.fail_workloads.lock().unwrap() {
            bail!("workload listing unavailable");
        }
        Ok(self.workloads.lock().unwrap().clone())
    }

    async fn list_pods(&self) -> Result<Vec<PodSpec>> {
        if *self.fail_pods.lock().unwrap() {
            bail!("pod listing unavailable");
        }
        Ok(self.pods.lock().unwrap().clone())
    }
}

/// Usage batches handed out once each.
#[derive(Default)]
pub struct FakeMetrics {
    pub pending: Mutex<Vec<ContainerUsageSample>>,
}

impl FakeMetrics {
    pub fn push(&self, samples: impl IntoIterator<Item = ContainerUsageSample>) {
        self.pending.lock().unwrap().extend(samples);
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn container_usage(&self) -> Result<Vec<ContainerUsageSample>> {
        Ok(std::mem::take(&mut *self.pending.lock().unwrap()))
    }
}

/// History that is either fixed or unavailable.
pub struct FakeHistory(pub Option<ClusterHistory>);

#[async_trait]
impl HistoryProvider for FakeHistory {
    async fn cluster_history(&self) -> Result<ClusterHistory> {
        match &self.0 {
            Some(history) => Ok(history.clone()),
            None => bail!("time-series backend unreachable"),
        }
    }
}
