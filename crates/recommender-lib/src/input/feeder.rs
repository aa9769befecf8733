//! Keeps the cluster state in sync with the orchestrator and usage sources

use super::source::{ClusterHistory, ClusterSource, HistoryProvider, MetricsSource};
use crate::checkpoint::CheckpointStore;
use crate::error::{HistogramError, SampleError};
use crate::models::{
    AggregateKey, ContainerSpec, ContainerUsageSample, PodPhase, PodSpec, WorkloadId,
    WorkloadSpec,
};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use crate::state::{AggregateContainerState, ClusterState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How the model is seeded at startup.
#[derive(Clone)]
pub enum InitializationStrategy {
    /// Restore aggregates from stored checkpoints.
    Checkpoint,
    /// Replay usage history from a time-series source.
    HistoricalBackfill(Arc<dyn HistoryProvider>),
}

impl InitializationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            InitializationStrategy::Checkpoint => "checkpoint",
            InitializationStrategy::HistoricalBackfill(_) => "historical_backfill",
        }
    }
}

impl std::fmt::Debug for InitializationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Feeder settings.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// Workloads naming this recommender (or none, for the default one) are tracked.
    pub recommender_name: String,
    /// Only this namespace is tracked when set.
    pub namespace: Option<String>,
    /// Upper bound on any single call to a source.
    pub source_timeout: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            recommender_name: crate::models::DEFAULT_RECOMMENDER_NAME.to_string(),
            namespace: None,
            source_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts of one sample batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSummary {
    pub applied: usize,
    pub rejected: usize,
    /// Valid samples that reached no aggregate: unowned pods, repeated CPU samples.
    pub ignored: usize,
}

/// What one refresh managed to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub workloads_listed: bool,
    pub pods_listed: bool,
    pub metrics_listed: bool,
    pub samples: SampleSummary,
}

impl RefreshSummary {
    pub fn is_complete(&self) -> bool {
        self.workloads_listed && self.pods_listed && self.metrics_listed
    }
}

/// Outcome of startup initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitSummary {
    pub restored_aggregates: usize,
    pub failed_checkpoints: usize,
    pub history_samples: SampleSummary,
}

/// Reads orchestrator objects and usage and writes them into the cluster state.
///
/// Sources are queried without holding the state lock; results are applied
/// under one write lock so readers never observe a half-applied refresh.
pub struct ClusterStateFeeder {
    cluster: Arc<RwLock<ClusterState>>,
    cluster_source: Arc<dyn ClusterSource>,
    metrics_source: Arc<dyn MetricsSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: FeederConfig,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
}

impl ClusterStateFeeder {
    pub fn new(
        cluster: Arc<RwLock<ClusterState>>,
        cluster_source: Arc<dyn ClusterSource>,
        metrics_source: Arc<dyn MetricsSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: FeederConfig,
    ) -> Self {
        let logger = StructuredLogger::new(config.recommender_name.clone());
        Self {
            cluster,
            cluster_source,
            metrics_source,
            checkpoints,
            config,
            metrics: RecommenderMetrics::new(),
            logger,
        }
    }

    pub fn cluster(&self) -> &Arc<RwLock<ClusterState>> {
        &self.cluster
    }

    /// Seed the model. A failed history query is fatal; unreadable
    /// checkpoints only cost their own container.
    pub async fn init(&self, strategy: &InitializationStrategy) -> Result<InitSummary> {
        self.load_workloads().await;

        let mut summary = InitSummary::default();
        match strategy {
            InitializationStrategy::Checkpoint => {
                let (restored, failed) = self.load_checkpoints().await;
                summary.restored_aggregates = restored;
                summary.failed_checkpoints = failed;
            }
            InitializationStrategy::HistoricalBackfill(provider) => {
                let history = self
                    .bounded(provider.cluster_history())
                    .await
                    .context("Failed to load usage history")?;
                summary.history_samples = self.apply_history(&history).await;
                self.logger.log_history_backfill(
                    history.pods.len(),
                    summary.history_samples.applied,
                    summary.history_samples.rejected,
                );
            }
        }
        Ok(summary)
    }

    /// Fetch workloads, pods and usage concurrently, then apply them in
    /// that order.
    pub async fn refresh(&self) -> RefreshSummary {
        let (workloads, pods, samples) = tokio::join!(
            self.bounded(self.cluster_source.list_workloads()),
            self.bounded(self.cluster_source.list_pods()),
            self.bounded(self.metrics_source.container_usage()),
        );

        let now = Utc::now();
        let mut summary = RefreshSummary::default();
        let mut cluster = self.cluster.write().await;

        summary.workloads_listed = self.apply_workloads(&mut cluster, workloads, now);
        summary.pods_listed = self.apply_pods(&mut cluster, pods, now);
        match samples {
            Ok(samples) => {
                summary.metrics_listed = true;
                summary.samples = self.apply_samples(&mut cluster, &samples);
            }
            Err(e) => warn!(error = %e, "Failed to fetch container usage"),
        }
        self.metrics
            .set_model_size(cluster.workloads().count(), cluster.num_aggregates());
        summary
    }

    /// List workloads and reconcile the tracked set. Returns whether the
    /// listing succeeded.
    pub async fn load_workloads(&self) -> bool {
        let workloads = self.bounded(self.cluster_source.list_workloads()).await;
        let mut cluster = self.cluster.write().await;
        self.apply_workloads(&mut cluster, workloads, Utc::now())
    }

    /// List pods and reconcile the tracked set. Returns whether the listing
    /// succeeded.
    pub async fn load_pods(&self) -> bool {
        let pods = self.bounded(self.cluster_source.list_pods()).await;
        let mut cluster = self.cluster.write().await;
        self.apply_pods(&mut cluster, pods, Utc::now())
    }

    /// Fetch live usage and apply it.
    pub async fn load_realtime_metrics(&self) -> Result<SampleSummary> {
        let samples = self
            .bounded(self.metrics_source.container_usage())
            .await
            .context("Failed to fetch container usage")?;
        let mut cluster = self.cluster.write().await;
        Ok(self.apply_samples(&mut cluster, &samples))
    }

    /// Drop aggregates that no live pod feeds and that saw no sample inside
    /// the memory aggregation window.
    pub async fn garbage_collect(&self, now: DateTime<Utc>) -> Vec<AggregateKey> {
        let removed = self.cluster.write().await.garbage_collect_aggregates(now);
        if !removed.is_empty() {
            info!(count = removed.len(), "Expired aggregate states removed");
        }
        removed
    }

    async fn load_checkpoints(&self) -> (usize, usize) {
        let keys = match self.checkpoints.list().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list checkpoints, starting without history");
                return (0, 0);
            }
        };

        let config = self.cluster.read().await.config().clone();
        let (mut restored, mut failed) = (0, 0);
        for key in keys {
            if !self.in_scope(&key.workload.namespace) {
                continue;
            }
            let loaded = self
                .checkpoints
                .load(&key)
                .await
                .and_then(|checkpoint| {
                    AggregateContainerState::load_from_checkpoint(config.clone(), &checkpoint)
                });
            let aggregate = match loaded {
                Ok(aggregate) => aggregate,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable checkpoint");
                    failed += 1;
                    continue;
                }
            };
            match self.cluster.write().await.restore_aggregate(&key, aggregate) {
                Ok(true) => restored += 1,
                Ok(false) => debug!(key = %key, "Checkpoint for untracked workload not loaded"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping incompatible checkpoint");
                    failed += 1;
                }
            }
        }
        info!(restored, failed, "Checkpoints loaded");
        (restored, failed)
    }

    async fn apply_history(&self, history: &ClusterHistory) -> SampleSummary {
        let now = Utc::now();
        let mut cluster = self.cluster.write().await;
        for (pod, pod_history) in &history.pods {
            if !self.in_scope(&pod.namespace) {
                continue;
            }
            let spec = PodSpec {
                id: pod.clone(),
                labels: pod_history.labels.clone(),
                phase: PodPhase::Running,
                containers: pod_history
                    .samples
                    .keys()
                    .map(|name| ContainerSpec {
                        name: name.clone(),
                        ..Default::default()
                    })
                    .collect(),
            };
            cluster.add_or_update_pod(&spec, now);
        }
        let samples: Vec<ContainerUsageSample> =
            history.samples_in_order().into_iter().cloned().collect();
        self.apply_samples(&mut cluster, &samples)
    }

    fn apply_workloads(
        &self,
        cluster: &mut ClusterState,
        workloads: Result<Vec<WorkloadSpec>>,
        now: DateTime<Utc>,
    ) -> bool {
        let workloads = match workloads {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(error = %e, "Failed to list workloads");
                cluster.record_workload_listing(Err(()), now);
                return false;
            }
        };

        let in_scope: Vec<WorkloadSpec> = workloads
            .into_iter()
            .filter(|w| self.in_scope(&w.id.namespace))
            .collect();
        let existing: HashSet<WorkloadId> = in_scope.iter().map(|w| w.id.clone()).collect();
        let owned: Vec<WorkloadSpec> = in_scope
            .into_iter()
            .filter(|w| w.is_handled_by(&self.config.recommender_name))
            .collect();
        let owned_ids: HashSet<WorkloadId> = owned.iter().map(|w| w.id.clone()).collect();

        for spec in owned {
            let id = spec.id.clone();
            if cluster.add_or_update_workload(spec, now) {
                debug!(workload = %id, "Workload added or updated");
            }
        }
        for id in cluster.workload_ids() {
            if !owned_ids.contains(&id) {
                debug!(workload = %id, "Workload no longer tracked");
                cluster.delete_workload(&id, now);
            }
        }
        cluster.record_workload_listing(Ok(existing), now);
        true
    }

    fn apply_pods(
        &self,
        cluster: &mut ClusterState,
        pods: Result<Vec<PodSpec>>,
        now: DateTime<Utc>,
    ) -> bool {
        let pods = match pods {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list pods");
                return false;
            }
        };

        let mut listed = HashSet::new();
        for pod in pods.iter().filter(|p| self.in_scope(&p.id.namespace)) {
            cluster.add_or_update_pod(pod, now);
            listed.insert(pod.id.clone());
        }
        for id in cluster.pod_ids() {
            if !listed.contains(&id) {
                cluster.delete_pod(&id, now);
            }
        }
        true
    }

    fn apply_samples(
        &self,
        cluster: &mut ClusterState,
        samples: &[ContainerUsageSample],
    ) -> SampleSummary {
        let mut summary = SampleSummary::default();
        for sample in samples
            .iter()
            .filter(|s| self.in_scope(&s.pod.namespace))
        {
            match cluster.add_sample(sample) {
                Ok(true) => {
                    summary.applied += 1;
                    self.metrics.inc_samples_processed(sample.resource);
                }
                Ok(false) => summary.ignored += 1,
                Err(e) => {
                    summary.rejected += 1;
                    self.metrics.inc_samples_rejected(rejection_reason(&e));
                    debug!(pod = %sample.pod, container = %sample.container, error = %e, "Sample rejected");
                }
            }
        }
        summary
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.config
            .namespace
            .as_deref()
            .map_or(true, |scope| scope.is_empty() || scope == namespace)
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.source_timeout, call)
            .await
            .map_err(|_| anyhow!("source call timed out after {:?}", self.config.source_timeout))?
    }
}

fn rejection_reason(error: &SampleError) -> &'static str {
    match error {
        SampleError::UnknownPod(_) => "unknown_pod",
        SampleError::UnknownContainer { .. } => "unknown_container",
        SampleError::Rejected(HistogramError::StaleSample { .. }) => "stale",
        SampleError::Rejected(_) => "invalid",
    }
}
