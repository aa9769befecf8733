//! Durable snapshots of aggregate container states
//!
//! Checkpoints are written periodically by [`CheckpointWriter`], read once
//! at startup, and removed by [`CheckpointGarbageCollector`] once their
//! workload is confirmed gone.

mod gc;
mod store;
mod writer;

pub use gc::{CheckpointGarbageCollector, GcSummary};
pub use store::{checksum, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use writer::{CheckpointWriter, CheckpointWriterConfig, WriteSummary};

use crate::histogram::HistogramCheckpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format version of [`ContainerCheckpoint`].
pub const CHECKPOINT_VERSION: &str = "v3";

/// Serialized form of one aggregate container state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCheckpoint {
    pub version: String,
    pub last_update_time: DateTime<Utc>,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
}
