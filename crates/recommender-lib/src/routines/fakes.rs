//! In-memory status sink for tests

use super::status::{StatusSink, VersionedStatus};
use crate::error::StatusError;
use crate::models::{WorkloadId, WorkloadStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Versioned statuses keyed by workload, with injectable write conflicts.
#[derive(Default)]
pub struct MemoryStatusSink {
    objects: Mutex<HashMap<WorkloadId, (WorkloadStatus, u64)>>,
    conflicts: Mutex<u32>,
    writes: Mutex<u32>,
}

impl MemoryStatusSink {
    pub fn create(&self, id: &WorkloadId) {
        self.objects
            .lock()
            .unwrap()
            .insert(id.clone(), (WorkloadStatus::default(), 1));
    }

    pub fn remove(&self, id: &WorkloadId) {
        self.objects.lock().unwrap().remove(id);
    }

    pub fn status(&self, id: &WorkloadId) -> Option<WorkloadStatus> {
        self.objects.lock().unwrap().get(id).map(|(s, _)| s.clone())
    }

    /// Fail the next `count` writes with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        *self.conflicts.lock().unwrap() = count;
    }

    pub fn writes(&self) -> u32 {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn read_status(&self, workload: &WorkloadId) -> Result<VersionedStatus, StatusError> {
        self.objects
            .lock()
            .unwrap()
            .get(workload)
            .map(|(status, version)| VersionedStatus {
                status: status.clone(),
                version: version.to_string(),
            })
            .ok_or_else(|| StatusError::NotFound(workload.to_string()))
    }

    async fn write_status(
        &self,
        workload: &WorkloadId,
        status: &WorkloadStatus,
        version: &str,
    ) -> Result<(), StatusError> {
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(StatusError::Conflict(workload.to_string()));
            }
        }
        let mut objects = self.objects.lock().unwrap();
        let (current, current_version) = objects
            .get_mut(workload)
            .ok_or_else(|| StatusError::NotFound(workload.to_string()))?;
        if current_version.to_string() != version {
            return Err(StatusError::Conflict(workload.to_string()));
        }
        *current = status.clone();
        *current_version += 1;
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }
}
