//! Periodic checkpoint writing

use super::CheckpointStore;
use crate::models::AggregateKey;
use crate::observability::RecommenderMetrics;
use crate::state::ClusterState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Limits of one checkpoint-writing run.
#[derive(Debug, Clone)]
pub struct CheckpointWriterConfig {
    /// Stop starting new writes once this much time has passed...
    pub deadline: Duration,
    /// ...but only after this many checkpoints were written.
    pub min_checkpoints: usize,
}

impl Default for CheckpointWriterConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            min_checkpoints: 10,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub failed: usize,
    /// Left for the next run because the deadline passed.
    pub postponed: usize,
}

/// Writes aggregate checkpoints, least recently written first.
pub struct CheckpointWriter {
    cluster: Arc<RwLock<ClusterState>>,
    store: Arc<dyn CheckpointStore>,
    config: CheckpointWriterConfig,
    last_written: HashMap<AggregateKey, DateTime<Utc>>,
    metrics: RecommenderMetrics,
}

impl CheckpointWriter {
    pub fn new(
        cluster: Arc<RwLock<ClusterState>>,
        store: Arc<dyn CheckpointStore>,
        config: CheckpointWriterConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            config,
            last_written: HashMap::new(),
            metrics: RecommenderMetrics::new(),
        }
    }

    pub fn last_written(&self, key: &AggregateKey) -> Option<DateTime<Utc>> {
        self.last_written.get(key).copied()
    }

    /// Write as many checkpoints as the deadline allows. Failed writes are
    /// logged and retried on the next run.
    pub async fn store_checkpoints(&mut self, now: DateTime<Utc>) -> WriteSummary {
        let started = Instant::now();
        let mut keys = self.cluster.read().await.workloads_to_checkpoint();

        self.last_written
            .retain(|key, _| keys.binary_search(key).is_ok());
        keys.sort_by(|a, b| {
            self.last_written
                .get(a)
                .cmp(&self.last_written.get(b))
                .then_with(|| a.cmp(b))
        });

        let mut summary = WriteSummary::default();
        for (index, key) in keys.iter().enumerate() {
            if summary.written >= self.config.min_checkpoints
                && started.elapsed() >= self.config.deadline
            {
                summary.postponed = keys.len() - index;
                break;
            }

            let checkpoint = {
                let cluster = self.cluster.read().await;
                cluster.checkpoint_of(key, now)
            };
            let Some(checkpoint) = checkpoint else {
                continue;
            };

            match self.store.save(key, &checkpoint).await {
                Ok(()) => {
                    self.last_written.insert(key.clone(), now);
                    summary.written += 1;
                    self.metrics.inc_checkpoints_written();
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to write checkpoint");
                    summary.failed += 1;
                    self.metrics.inc_checkpoint_write_failures();
                }
            }
        }

        if summary.postponed > 0 {
            info!(
                written = summary.written,
                postponed = summary.postponed,
                "Checkpoint deadline reached"
            );
        } else {
            debug!(
                written = summary.written,
                failed = summary.failed,
                "Checkpoints stored"
            );
        }
        summary
    }
}
