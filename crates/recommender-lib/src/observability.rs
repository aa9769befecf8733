//! Observability infrastructure for the recommender
//!
//! Provides:
//! - Prometheus metrics (samples, recommendations, checkpoints, loop latency)
//! - Structured JSON logging with tracing

use crate::models::{ResourceAmount, ResourceName, WorkloadId};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for the reconciliation loop (in seconds)
const RUN_ONCE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RecommenderMetricsInner> = OnceLock::new();

struct RecommenderMetricsInner {
    samples_processed: IntCounterVec,
    samples_rejected: IntCounterVec,
    recommendations_computed: IntCounter,
    run_once_latency_seconds: Histogram,
    last_run_once_timestamp: IntGauge,
    aggregate_states: IntGauge,
    tracked_workloads: IntGauge,
    checkpoints_written: IntCounter,
    checkpoint_write_failures: IntCounter,
    checkpoints_garbage_collected: IntCounter,
    status_write_conflicts: IntCounter,
}

impl RecommenderMetricsInner {
    fn new() -> Self {
        Self {
            samples_processed: register_int_counter_vec!(
                "vpa_recommender_aggregate_samples_total",
                "Usage samples applied to aggregate container states",
                &["resource"]
            )
            .expect("Failed to register aggregate_samples_total"),

            samples_rejected: register_int_counter_vec!(
                "vpa_recommender_rejected_samples_total",
                "Usage samples rejected before reaching a histogram",
                &["reason"]
            )
            .expect("Failed to register rejected_samples_total"),

            recommendations_computed: register_int_counter!(
                "vpa_recommender_recommendations_total",
                "Container recommendations computed"
            )
            .expect("Failed to register recommendations_total"),

            run_once_latency_seconds: register_histogram!(
                "vpa_recommender_run_once_duration_seconds",
                "Time spent in one reconciliation cycle",
                RUN_ONCE_BUCKETS.to_vec()
            )
            .expect("Failed to register run_once_duration_seconds"),

            last_run_once_timestamp: register_int_gauge!(
                "vpa_recommender_last_run_once_timestamp_seconds",
                "Unix time of the last successful reconciliation cycle"
            )
            .expect("Failed to register last_run_once_timestamp_seconds"),

            aggregate_states: register_int_gauge!(
                "vpa_recommender_aggregate_container_states",
                "Aggregate container states held in memory"
            )
            .expect("Failed to register aggregate_container_states"),

            tracked_workloads: register_int_gauge!(
                "vpa_recommender_tracked_workloads",
                "Workloads owned by this recommender"
            )
            .expect("Failed to register tracked_workloads"),

            checkpoints_written: register_int_counter!(
                "vpa_recommender_checkpoints_written_total",
                "Checkpoints written to the store"
            )
            .expect("Failed to register checkpoints_written_total"),

            checkpoint_write_failures: register_int_counter!(
                "vpa_recommender_checkpoint_write_failures_total",
                "Checkpoint writes that failed"
            )
            .expect("Failed to register checkpoint_write_failures_total"),

            checkpoints_garbage_collected: register_int_counter!(
                "vpa_recommender_checkpoints_garbage_collected_total",
                "Checkpoints deleted because their workload is gone"
            )
            .expect("Failed to register checkpoints_garbage_collected_total"),

            status_write_conflicts: register_int_counter!(
                "vpa_recommender_status_write_conflicts_total",
                "Recommendation writes that hit a concurrent modification"
            )
            .expect("Failed to register status_write_conflicts_total"),
        }
    }
}

/// Recommender metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct RecommenderMetrics {
    _private: (),
}

impl Default for RecommenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RecommenderMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RecommenderMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RecommenderMetricsInner {
        GLOBAL_METRICS.get_or_init(RecommenderMetricsInner::new)
    }

    pub fn inc_samples_processed(&self, resource: ResourceName) {
        self.inner()
            .samples_processed
            .with_label_values(&[resource.as_str()])
            .inc();
    }

    /// Count a rejected sample; `reason` is a short machine-readable tag.
    pub fn inc_samples_rejected(&self, reason: &str) {
        self.inner()
            .samples_rejected
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_recommendations_computed(&self, count: u64) {
        self.inner().recommendations_computed.inc_by(count);
    }

    /// Record the duration of a completed reconciliation cycle
    pub fn observe_run_once(&self, duration_secs: f64, finished_at_unix: i64) {
        self.inner().run_once_latency_seconds.observe(duration_secs);
        self.inner().last_run_once_timestamp.set(finished_at_unix);
    }

    pub fn set_model_size(&self, workloads: usize, aggregates: usize) {
        self.inner().tracked_workloads.set(workloads as i64);
        self.inner().aggregate_states.set(aggregates as i64);
    }

    pub fn inc_checkpoints_written(&self) {
        self.inner().checkpoints_written.inc();
    }

    pub fn inc_checkpoint_write_failures(&self) {
        self.inner().checkpoint_write_failures.inc();
    }

    pub fn inc_checkpoints_garbage_collected(&self) {
        self.inner().checkpoints_garbage_collected.inc();
    }

    pub fn inc_status_write_conflicts(&self) {
        self.inner().status_write_conflicts.inc();
    }
}

/// Structured logger for recommender lifecycle events
///
/// Every event carries a stable `event` field so log pipelines can filter
/// on it.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    recommender: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(crate::models::DEFAULT_RECOMMENDER_NAME)
    }
}

impl StructuredLogger {
    pub fn new(recommender: impl Into<String>) -> Self {
        Self {
            recommender: recommender.into(),
        }
    }

    pub fn recommender(&self) -> &str {
        &self.recommender
    }

    /// Log recommender startup
    pub fn log_startup(&self, version: &str, initialization: &str) {
        info!(
            event = "recommender_started",
            recommender = %self.recommender,
            version = %version,
            initialization = %initialization,
            "Recommender started"
        );
    }

    /// Log recommender shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "recommender_shutdown",
            recommender = %self.recommender,
            reason = %reason,
            "Recommender shutting down"
        );
    }

    /// Log a computed container recommendation
    pub fn log_recommendation(
        &self,
        workload: &WorkloadId,
        container: &str,
        cpu_target: Option<ResourceAmount>,
        memory_target: Option<ResourceAmount>,
        confidence: f64,
    ) {
        info!(
            event = "recommendation_computed",
            recommender = %self.recommender,
            workload = %workload,
            container = %container,
            cpu_target_millicores = cpu_target.map(|a| a.0),
            memory_target_bytes = memory_target.map(|a| a.0),
            confidence = confidence,
            "Computed resource recommendation"
        );
    }

    /// Log the outcome of a checkpoint garbage collection pass
    pub fn log_checkpoint_gc(&self, deleted: usize, deferred: usize, kept: usize) {
        if deferred > 0 {
            warn!(
                event = "checkpoint_gc",
                recommender = %self.recommender,
                deleted = deleted,
                deferred = deferred,
                kept = kept,
                "Checkpoint GC deferred entries with unknown workload state"
            );
        } else {
            info!(
                event = "checkpoint_gc",
                recommender = %self.recommender,
                deleted = deleted,
                kept = kept,
                "Checkpoint GC finished"
            );
        }
    }

    /// Log the startup history backfill
    pub fn log_history_backfill(&self, pods: usize, samples: usize, rejected: usize) {
        info!(
            event = "history_backfill",
            recommender = %self.recommender,
            pods = pods,
            samples = samples,
            rejected = rejected,
            "Loaded usage history"
        );
    }

    /// Log a recommendation write-back given up until the next cycle
    pub fn log_status_write_deferred(&self, workload: &WorkloadId, attempts: u32, reason: &str) {
        warn!(
            event = "status_write_deferred",
            recommender = %self.recommender,
            workload = %workload,
            attempts = attempts,
            reason = %reason,
            "Recommendation write deferred to next cycle"
        );
    }
}
