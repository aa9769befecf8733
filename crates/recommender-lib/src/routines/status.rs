//! Writing recommendations back to workload status

use crate::error::StatusError;
use crate::models::{WorkloadId, WorkloadStatus};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A workload status together with the object version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedStatus {
    pub status: WorkloadStatus,
    pub version: String,
}

/// Where recommendations are published.
///
/// Writes are conditional on the version returned by the last read; a write
/// against a stale version fails with [`StatusError::Conflict`].
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn read_status(&self, workload: &WorkloadId) -> Result<VersionedStatus, StatusError>;

    async fn write_status(
        &self,
        workload: &WorkloadId,
        status: &WorkloadStatus,
        version: &str,
    ) -> Result<(), StatusError>;
}

/// Result of one publish attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWriteOutcome {
    Written { attempts: u32 },
    /// The published status already matches.
    Unchanged,
    /// Left for the next cycle.
    Deferred { attempts: u32 },
    /// The workload object no longer exists.
    WorkloadGone,
}

pub const DEFAULT_STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Publishes statuses, re-reading and retrying on conflicts a bounded number
/// of times.
#[derive(Clone)]
pub struct StatusWriter {
    sink: Arc<dyn StatusSink>,
    max_attempts: u32,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
}

impl StatusWriter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            max_attempts: DEFAULT_STATUS_WRITE_ATTEMPTS,
            metrics: RecommenderMetrics::new(),
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub async fn publish(&self, workload: &WorkloadId, status: &WorkloadStatus) -> StatusWriteOutcome {
        let mut attempts = 0;
        while attempts < self.max_attempts {
            attempts += 1;
            let current = match self.sink.read_status(workload).await {
                Ok(current) => current,
                Err(StatusError::NotFound(_)) => return StatusWriteOutcome::WorkloadGone,
                Err(e) => return self.defer(workload, attempts, &e),
            };
            if current.status.is_equivalent(status) {
                return StatusWriteOutcome::Unchanged;
            }

            match self
                .sink
                .write_status(workload, status, &current.version)
                .await
            {
                Ok(()) => return StatusWriteOutcome::Written { attempts },
                Err(StatusError::Conflict(_)) => {
                    self.metrics.inc_status_write_conflicts();
                    debug!(workload = %workload, attempts, "Status write conflict, re-reading");
                }
                Err(StatusError::NotFound(_)) => return StatusWriteOutcome::WorkloadGone,
                Err(e) => return self.defer(workload, attempts, &e),
            }
        }
        self.defer(
            workload,
            attempts,
            &StatusError::Conflict(workload.to_string()),
        )
    }

    fn defer(&self, workload: &WorkloadId, attempts: u32, error: &StatusError) -> StatusWriteOutcome {
        self.logger
            .log_status_write_deferred(workload, attempts, &error.to_string());
        StatusWriteOutcome::Deferred { attempts }
    }
}
