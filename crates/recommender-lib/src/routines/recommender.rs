//! The reconciliation cycle: ingest, estimate, post-process, publish

use super::scheduler::Routine;
use super::status::{StatusWriteOutcome, StatusWriter};
use crate::health::{components, HealthRegistry};
use crate::input::ClusterStateFeeder;
use crate::logic::{PodResourceRecommender, PostProcessorChain};
use crate::models::{
    ConditionType, Recommendation, ResourceName, WorkloadCondition, WorkloadId, WorkloadStatus,
};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use crate::state::WorkloadView;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Settings of the reconciliation cycle.
#[derive(Debug, Clone)]
pub struct RunOnceConfig {
    /// How often expired aggregates are dropped from the model.
    pub aggregate_gc_interval: Duration,
    /// Workloads whose least-confident container has less history than
    /// this many days are flagged `LowConfidence`.
    pub low_confidence_days: f64,
}

impl Default for RunOnceConfig {
    fn default() -> Self {
        Self {
            aggregate_gc_interval: Duration::from_secs(3600),
            low_confidence_days: 1.0,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOnceSummary {
    pub workloads: usize,
    pub containers_recommended: usize,
    pub statuses_written: usize,
    pub statuses_deferred: usize,
    pub aggregates_expired: usize,
}

/// Drives one full reconciliation per call of [`Recommender::run_once`].
pub struct Recommender {
    feeder: ClusterStateFeeder,
    recommender: PodResourceRecommender,
    post_processors: PostProcessorChain,
    status_writer: StatusWriter,
    health: HealthRegistry,
    config: RunOnceConfig,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
    last_aggregate_gc: Option<DateTime<Utc>>,
}

impl Recommender {
    pub fn new(
        feeder: ClusterStateFeeder,
        recommender: PodResourceRecommender,
        post_processors: PostProcessorChain,
        status_writer: StatusWriter,
        health: HealthRegistry,
        config: RunOnceConfig,
    ) -> Self {
        Self {
            feeder,
            recommender,
            post_processors,
            status_writer,
            health,
            config,
            metrics: RecommenderMetrics::new(),
            logger: StructuredLogger::default(),
            last_aggregate_gc: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn feeder(&self) -> &ClusterStateFeeder {
        &self.feeder
    }

    /// One reconciliation cycle. Ingestion completes before any estimate is
    /// computed, and every status is computed before any is published.
    pub async fn run_once(&mut self) -> RunOnceSummary {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = RunOnceSummary::default();

        let refresh = self.feeder.refresh().await;
        if refresh.is_complete() {
            self.health.set_healthy(components::FEEDER).await;
        } else {
            self.health
                .set_degraded(components::FEEDER, "Some cluster sources could not be read")
                .await;
        }

        if self.aggregate_gc_due(now) {
            summary.aggregates_expired = self.feeder.garbage_collect(now).await.len();
            self.last_aggregate_gc = Some(now);
        }

        let statuses = self.compute_statuses(now).await;
        summary.workloads = statuses.len();

        let mut changed = Vec::new();
        {
            let mut cluster = self.feeder.cluster().write().await;
            for (id, status, _) in &statuses {
                if cluster.set_recommendation(id, status.clone()) {
                    changed.push(id.clone());
                }
            }
        }

        for (id, status, confidence) in &statuses {
            let containers = status
                .recommendation
                .as_ref()
                .map_or(0, |r| r.containers.len());
            summary.containers_recommended += containers;
            if changed.contains(id) {
                self.log_status(id, status, *confidence);
            }

            match self.status_writer.publish(id, status).await {
                StatusWriteOutcome::Written { .. } => summary.statuses_written += 1,
                StatusWriteOutcome::Deferred { .. } => summary.statuses_deferred += 1,
                StatusWriteOutcome::Unchanged => {}
                StatusWriteOutcome::WorkloadGone => {
                    debug!(workload = %id, "Workload vanished before its status was written");
                }
            }
        }

        self.metrics
            .inc_recommendations_computed(summary.containers_recommended as u64);
        let finished = Utc::now();
        self.metrics
            .observe_run_once(started.elapsed().as_secs_f64(), finished.timestamp());
        self.health.record_run_once(finished).await;
        if summary.statuses_deferred > 0 {
            self.health
                .set_degraded(
                    components::RECOMMENDER,
                    format!("{} status writes deferred", summary.statuses_deferred),
                )
                .await;
        } else {
            self.health.set_healthy(components::RECOMMENDER).await;
        }

        info!(
            workloads = summary.workloads,
            containers = summary.containers_recommended,
            written = summary.statuses_written,
            deferred = summary.statuses_deferred,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recommendation cycle complete"
        );
        summary
    }

    fn aggregate_gc_due(&self, now: DateTime<Utc>) -> bool {
        let interval = chrono::Duration::from_std(self.config.aggregate_gc_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.last_aggregate_gc
            .map_or(true, |last| now - last >= interval)
    }

    /// Status of every tracked workload, with the smallest confidence among
    /// its recommended containers.
    async fn compute_statuses(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(WorkloadId, WorkloadStatus, Option<f64>)> {
        let cluster = self.feeder.cluster().read().await;
        cluster
            .workload_ids()
            .into_iter()
            .filter_map(|id| {
                let view = cluster.estimation_view(&id)?;
                let previous = cluster.workload(&id).map(|w| w.status.clone()).unwrap_or_default();
                let containers = self.recommender.recommend(&view.containers);
                let recommendation = self
                    .post_processors
                    .apply(&view, Recommendation { containers });
                let confidence = min_confidence(&view, &recommendation);
                let status = self.build_status(&view, recommendation, confidence, &previous, now);
                Some((id, status, confidence))
            })
            .collect()
    }

    fn build_status(
        &self,
        view: &WorkloadView,
        recommendation: Recommendation,
        confidence: Option<f64>,
        previous: &WorkloadStatus,
        now: DateTime<Utc>,
    ) -> WorkloadStatus {
        let provided = !recommendation.is_empty();
        let low_confidence = confidence.is_some_and(|c| c < self.config.low_confidence_days);
        let no_pods = view.pod_count == 0;

        let conditions = vec![
            condition(
                previous,
                ConditionType::RecommendationProvided,
                provided,
                None,
                now,
            ),
            condition(
                previous,
                ConditionType::LowConfidence,
                low_confidence,
                low_confidence.then(|| "Recommendation is based on little usage history".to_string()),
                now,
            ),
            condition(
                previous,
                ConditionType::NoPodsMatched,
                no_pods,
                no_pods.then(|| "No pods match this workload".to_string()),
                now,
            ),
        ];

        WorkloadStatus {
            recommendation: provided.then_some(recommendation),
            conditions,
        }
    }

    fn log_status(&self, id: &WorkloadId, status: &WorkloadStatus, confidence: Option<f64>) {
        let Some(recommendation) = &status.recommendation else {
            debug!(workload = %id, "No recommendation yet");
            return;
        };
        for container in &recommendation.containers {
            self.logger.log_recommendation(
                id,
                &container.container_name,
                container.target.get(&ResourceName::Cpu).copied(),
                container.target.get(&ResourceName::Memory).copied(),
                confidence.unwrap_or(0.0),
            );
        }
    }
}

/// Keeps the previous transition time when the condition did not flip.
fn condition(
    previous: &WorkloadStatus,
    condition_type: ConditionType,
    status: bool,
    message: Option<String>,
    now: DateTime<Utc>,
) -> WorkloadCondition {
    let last_transition_time = previous
        .condition(condition_type)
        .filter(|c| c.status == status)
        .map_or(now, |c| c.last_transition_time);
    WorkloadCondition {
        condition_type,
        status,
        message,
        last_transition_time,
    }
}

fn min_confidence(view: &WorkloadView, recommendation: &Recommendation) -> Option<f64> {
    recommendation
        .containers
        .iter()
        .filter_map(|c| view.containers.get(&c.container_name))
        .map(|aggregate| aggregate.confidence())
        .reduce(f64::min)
}

#[async_trait]
impl Routine for Recommender {
    fn name(&self) -> &'static str {
        "recommender"
    }

    async fn run_once(&mut self) {
        let summary = Recommender::run_once(self).await;
        if summary.statuses_deferred > 0 {
            warn!(
                deferred = summary.statuses_deferred,
                "Some recommendations were not published this cycle"
            );
        }
    }
}
