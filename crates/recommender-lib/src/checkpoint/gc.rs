//! Removal of checkpoints whose workload is gone

use super::CheckpointStore;
use crate::models::AggregateKey;
use crate::observability::{RecommenderMetrics, StructuredLogger};
use crate::state::{CheckpointDisposition, ClusterState};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub deleted: Vec<AggregateKey>,
    pub deferred: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Deletes checkpoints of workloads confirmed removed.
///
/// Checkpoints whose workload state is unknown (no successful listing yet,
/// or the last listing failed) are left alone until a later pass.
pub struct CheckpointGarbageCollector {
    cluster: Arc<RwLock<ClusterState>>,
    store: Arc<dyn CheckpointStore>,
    namespace: Option<String>,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
}

impl CheckpointGarbageCollector {
    pub fn new(cluster: Arc<RwLock<ClusterState>>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            cluster,
            store,
            namespace: None,
            metrics: RecommenderMetrics::new(),
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Only consider checkpoints in `namespace`.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub async fn collect(&self) -> Result<GcSummary> {
        let keys: Vec<AggregateKey> = self
            .store
            .list()
            .await
            .context("Failed to list checkpoints")?
            .into_iter()
            .filter(|key| {
                self.namespace
                    .as_ref()
                    .map_or(true, |ns| &key.workload.namespace == ns)
            })
            .collect();

        let dispositions: Vec<(AggregateKey, CheckpointDisposition)> = {
            let cluster = self.cluster.read().await;
            keys.into_iter()
                .map(|key| {
                    let disposition = cluster.checkpoint_disposition(&key);
                    (key, disposition)
                })
                .collect()
        };

        let mut summary = GcSummary::default();
        for (key, disposition) in dispositions {
            match disposition {
                CheckpointDisposition::Keep => summary.kept += 1,
                CheckpointDisposition::Defer => summary.deferred += 1,
                CheckpointDisposition::Delete => match self.store.delete(&key).await {
                    Ok(()) => {
                        self.metrics.inc_checkpoints_garbage_collected();
                        summary.deleted.push(key);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to delete checkpoint");
                        summary.failed += 1;
                    }
                },
            }
        }

        self.logger
            .log_checkpoint_gc(summary.deleted.len(), summary.deferred, summary.kept);
        Ok(summary)
    }
}
