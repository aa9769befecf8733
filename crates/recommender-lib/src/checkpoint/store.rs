//! Checkpoint persistence backends

use super::ContainerCheckpoint;
use crate::error::CheckpointError;
use crate::models::{AggregateKey, WorkloadId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where checkpoints live between restarts.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Keys of every stored checkpoint.
    async fn list(&self) -> Result<Vec<AggregateKey>, CheckpointError>;

    async fn load(&self, key: &AggregateKey) -> Result<ContainerCheckpoint, CheckpointError>;

    /// Create or replace the checkpoint under `key`.
    async fn save(
        &self,
        key: &AggregateKey,
        checkpoint: &ContainerCheckpoint,
    ) -> Result<(), CheckpointError>;

    /// Remove the checkpoint under `key`. Removing a missing checkpoint succeeds.
    async fn delete(&self, key: &AggregateKey) -> Result<(), CheckpointError>;
}

/// SHA-256 of the checkpoint's JSON encoding, hex encoded.
pub fn checksum(checkpoint: &ContainerCheckpoint) -> Result<String, CheckpointError> {
    let bytes = serde_json::to_vec(checkpoint)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// On-disk envelope of a checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    key: AggregateKey,
    checksum: String,
    checkpoint: ContainerCheckpoint,
}

/// Checkpoints as JSON files laid out as `<root>/<namespace>/<workload>/<container>.json`.
///
/// Files are written to a temporary sibling and renamed into place, so a
/// crash mid-write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &AggregateKey) -> PathBuf {
        self.root
            .join(&key.workload.namespace)
            .join(&key.workload.name)
            .join(format!("{}.json", key.container))
    }

    async fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push((name.to_string(), entry.path()));
                }
            }
        }
        Ok(dirs)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn list(&self) -> Result<Vec<AggregateKey>, CheckpointError> {
        let mut keys = Vec::new();
        for (namespace, namespace_dir) in Self::subdirectories(&self.root).await? {
            for (workload, workload_dir) in Self::subdirectories(&namespace_dir).await? {
                let mut entries = tokio::fs::read_dir(&workload_dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Some(container) = path.file_stem().and_then(|s| s.to_str()) {
                        keys.push(AggregateKey::new(
                            WorkloadId::new(namespace.clone(), workload.clone()),
                            container,
                        ));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn load(&self, key: &AggregateKey) -> Result<ContainerCheckpoint, CheckpointError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredCheckpoint = serde_json::from_slice(&data)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {}", path.display(), e)))?;
        if &stored.key != key {
            return Err(CheckpointError::Corrupt(format!(
                "{} holds checkpoint for {}",
                path.display(),
                stored.key
            )));
        }
        if checksum(&stored.checkpoint)? != stored.checksum {
            return Err(CheckpointError::Corrupt(format!(
                "{}: checksum mismatch",
                path.display()
            )));
        }
        Ok(stored.checkpoint)
    }

    async fn save(
        &self,
        key: &AggregateKey,
        checkpoint: &ContainerCheckpoint,
    ) -> Result<(), CheckpointError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stored = StoredCheckpoint {
            key: key.clone(),
            checksum: checksum(checkpoint)?,
            checkpoint: checkpoint.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(key = %key, path = %path.display(), bytes = json.len(), "Checkpoint saved");
        Ok(())
    }

    async fn delete(&self, key: &AggregateKey) -> Result<(), CheckpointError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Best-effort cleanup of the now possibly empty workload directory.
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::remove_dir(parent).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(dir = %parent.display(), error = %e, "Workload directory kept");
                }
            }
        }
        Ok(())
    }
}

/// Process-local store, used in tests and when no durable store is configured.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<AggregateKey, ContainerCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn contains(&self, key: &AggregateKey) -> bool {
        self.checkpoints.contains_key(key)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn list(&self) -> Result<Vec<AggregateKey>, CheckpointError> {
        let mut keys: Vec<AggregateKey> = self
            .checkpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn load(&self, key: &AggregateKey) -> Result<ContainerCheckpoint, CheckpointError> {
        self.checkpoints
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CheckpointError::NotFound(key.to_string()))
    }

    async fn save(
        &self,
        key: &AggregateKey,
        checkpoint: &ContainerCheckpoint,
    ) -> Result<(), CheckpointError> {
        self.checkpoints.insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, key: &AggregateKey) -> Result<(), CheckpointError> {
        if self.checkpoints.remove(key).is_none() {
            warn!(key = %key, "Deleting checkpoint that does not exist");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AggregateContainerState, AggregationsConfig};
    use crate::models::ResourceName;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(workload: &str, container: &str) -> AggregateKey {
        AggregateKey::new(WorkloadId::new("prod", workload), container)
    }

    fn checkpoint() -> ContainerCheckpoint {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut state = AggregateContainerState::new(Arc::new(AggregationsConfig::default()), start);
        for minute in 0..5 {
            state
                .add_sample(
                    ResourceName::Cpu,
                    0.25,
                    start + chrono::Duration::minutes(minute),
                )
                .unwrap();
        }
        state.save_to_checkpoint(start + chrono::Duration::minutes(5))
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let original = checkpoint();

        store.save(&key("web", "app"), &original).await.unwrap();
        store.save(&key("web", "sidecar"), &original).await.unwrap();
        store.save(&key("api", "app"), &original).await.unwrap();

        assert_eq!(
            store.list().await.unwrap(),
            vec![key("api", "app"), key("web", "app"), key("web", "sidecar")]
        );
        assert_eq!(store.load(&key("web", "app")).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_file_store_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("not-created-yet"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.load(&key("web", "app")).await,
            Err(CheckpointError::NotFound(_))
        ));
        store.delete(&key("web", "app")).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&key("web", "app"), &checkpoint()).await.unwrap();

        let path = dir.path().join("prod/web/app.json");
        let text = std::fs::read_to_string(&path).unwrap();
        let tampered = text.replacen("\"total_samples_count\": 5", "\"total_samples_count\": 6", 1);
        assert_ne!(text, tampered);
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(
            store.load(&key("web", "app")).await,
            Err(CheckpointError::Corrupt(_))
        ));

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            store.load(&key("web", "app")).await,
            Err(CheckpointError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&key("web", "app"), &checkpoint()).await.unwrap();
        store.delete(&key("web", "app")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(!dir.path().join("prod/web").exists());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        tokio_test::block_on(async {
            store.save(&key("web", "app"), &checkpoint()).await.unwrap();
            assert!(store.contains(&key("web", "app")));
            assert_eq!(store.list().await.unwrap(), vec![key("web", "app")]);
            store.delete(&key("web", "app")).await.unwrap();
        });
        assert!(store.is_empty());
    }
}
