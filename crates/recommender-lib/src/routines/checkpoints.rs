//! Checkpoint writing and collection on their own timers

use super::scheduler::Routine;
use crate::checkpoint::{CheckpointGarbageCollector, CheckpointWriter};
use crate::health::{components, HealthRegistry};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

/// Periodic [`CheckpointWriter`] run.
pub struct CheckpointWriterRoutine {
    writer: CheckpointWriter,
    health: HealthRegistry,
}

impl CheckpointWriterRoutine {
    pub fn new(writer: CheckpointWriter, health: HealthRegistry) -> Self {
        Self { writer, health }
    }

    pub fn writer(&self) -> &CheckpointWriter {
        &self.writer
    }
}

#[async_trait]
impl Routine for CheckpointWriterRoutine {
    fn name(&self) -> &'static str {
        "checkpoint_writer"
    }

    async fn run_once(&mut self) {
        let summary = self.writer.store_checkpoints(Utc::now()).await;
        if summary.failed > 0 {
            self.health
                .set_degraded(
                    components::CHECKPOINT_WRITER,
                    format!("{} checkpoint writes failed", summary.failed),
                )
                .await;
        } else {
            self.health.set_healthy(components::CHECKPOINT_WRITER).await;
        }
    }
}

/// Periodic [`CheckpointGarbageCollector`] run.
pub struct CheckpointGcRoutine {
    gc: CheckpointGarbageCollector,
    health: HealthRegistry,
}

impl CheckpointGcRoutine {
    pub fn new(gc: CheckpointGarbageCollector, health: HealthRegistry) -> Self {
        Self { gc, health }
    }
}

#[async_trait]
impl Routine for CheckpointGcRoutine {
    fn name(&self) -> &'static str {
        "checkpoint_gc"
    }

    async fn run_once(&mut self) {
        match self.gc.collect().await {
            Ok(summary) if summary.failed > 0 => {
                self.health
                    .set_degraded(
                        components::CHECKPOINT_GC,
                        format!("{} checkpoint deletions failed", summary.failed),
                    )
                    .await;
            }
            Ok(_) => self.health.set_healthy(components::CHECKPOINT_GC).await,
            Err(e) => {
                warn!(error = %e, "Checkpoint garbage collection failed");
                self.health
                    .set_degraded(components::CHECKPOINT_GC, format!("{e:#}"))
                    .await;
            }
        }
    }
}
