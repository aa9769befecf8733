//! Periodic routines of the recommender process

mod checkpoints;
mod recommender;
mod scheduler;
mod status;

#[cfg(test)]
pub(crate) mod fakes;
#[cfg(test)]
mod tests;

pub use checkpoints::{CheckpointGcRoutine, CheckpointWriterRoutine};
pub use recommender::{Recommender, RunOnceConfig, RunOnceSummary};
pub use scheduler::{run_periodically, Routine};
pub use status::{
    StatusSink, StatusWriteOutcome, StatusWriter, VersionedStatus, DEFAULT_STATUS_WRITE_ATTEMPTS,
};
