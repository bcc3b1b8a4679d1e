//! Checkpoint store implementations

use super::{CheckpointDocument, CheckpointStore};
use crate::error::{LifecycleError, Result};
use crate::models::DetectorId;
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Process-local store, used in tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    documents: DashMap<DetectorId, CheckpointDocument>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<CheckpointDocument>> {
        Ok(self.documents.get(detector_id).map(|d| d.clone()))
    }

    async fn put(&self, document: CheckpointDocument) -> Result<()> {
        self.documents.insert(document.detector_id.clone(), document);
        Ok(())
    }

    async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        Ok(self.documents.remove(detector_id).is_some())
    }

    async fn list(&self) -> Result<Vec<DetectorId>> {
        Ok(self.documents.iter().map(|d| d.key().clone()).collect())
    }

    async fn delete_older_than(&self, cutoff_millis: i64) -> Result<Vec<DetectorId>> {
        let expired: Vec<DetectorId> = self
            .documents
            .iter()
            .filter(|entry| entry.updated_at < cutoff_millis)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.documents
                .remove_if(id, |_, doc| doc.updated_at < cutoff_millis);
        }
        Ok(expired)
    }
}

/// One JSON file per detector under a directory
///
/// File names are the hex encoding of the detector id, so any id is a
/// valid file name. Writes go to a temp file that is synced and renamed.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create checkpoint directory {:?}", dir))?;
        Ok(Self { dir })
    }

    fn path_for(&self, detector_id: &DetectorId) -> PathBuf {
        self.dir
            .join(format!("{}.json", hex::encode(detector_id.as_str())))
    }

    async fn read_document(path: &Path) -> anyhow::Result<Option<CheckpointDocument>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read checkpoint {:?}", path))
            }
        };
        let document = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to decode checkpoint {:?}", path))?;
        Ok(Some(document))
    }

    async fn write_document(&self, document: &CheckpointDocument) -> anyhow::Result<()> {
        let path = self.path_for(&document.detector_id);
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec(document).context("Failed to serialize checkpoint")?;

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp checkpoint {:?}", temp_path))?;
        file.write_all(&json)
            .await
            .context("Failed to write checkpoint")?;
        file.sync_all().await.context("Failed to sync checkpoint")?;

        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }
}

fn unavailable(e: anyhow::Error) -> LifecycleError {
    LifecycleError::StoreUnavailable(format!("{:#}", e))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<CheckpointDocument>> {
        let path = self.path_for(detector_id);
        match Self::read_document(&path).await {
            Ok(doc) => Ok(doc),
            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                Err(LifecycleError::CheckpointCorrupt {
                    detector_id: detector_id.clone(),
                    reason: format!("{:#}", e),
                })
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn put(&self, document: CheckpointDocument) -> Result<()> {
        self.write_document(&document).await.map_err(unavailable)
    }

    async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        match fs::remove_file(self.path_for(detector_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LifecycleError::StoreUnavailable(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<DetectorId>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| LifecycleError::StoreUnavailable(e.to_string()))?;
        let mut ids = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LifecycleError::StoreUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| String::from_utf8(b).ok());
            match decoded {
                Some(id) => ids.push(DetectorId::new(id)),
                None => warn!(path = %path.display(), "Skipping unrecognised checkpoint file"),
            }
        }

        Ok(ids)
    }

    async fn delete_older_than(&self, cutoff_millis: i64) -> Result<Vec<DetectorId>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| LifecycleError::StoreUnavailable(e.to_string()))?;
        let mut deleted = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LifecycleError::StoreUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match Self::read_document(&path).await {
                Ok(Some(doc)) if doc.updated_at < cutoff_millis => {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove expired checkpoint");
                        continue;
                    }
                    debug!(detector_id = %doc.detector_id, "Removed expired checkpoint");
                    deleted.push(doc.detector_id);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }

        Ok(deleted)
    }
}

/// Store wrapper whose I/O can be switched off, for failure-path tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyCheckpointStore {
    pub inner: InMemoryCheckpointStore,
    pub failing: std::sync::atomic::AtomicBool,
    pub puts: std::sync::atomic::AtomicUsize,
    /// Millis the next put sleeps before writing
    next_put_delay_ms: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl FlakyCheckpointStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Make the next put slow; later puts are not delayed
    pub fn delay_next_put(&self, delay: std::time::Duration) {
        self.next_put_delay_ms
            .store(delay.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether the delayed put has not started yet
    pub fn delay_armed(&self) -> bool {
        self.next_put_delay_ms
            .load(std::sync::atomic::Ordering::SeqCst)
            > 0
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(LifecycleError::StoreUnavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<CheckpointDocument>> {
        self.check()?;
        self.inner.get(detector_id).await
    }

    async fn put(&self, document: CheckpointDocument) -> Result<()> {
        self.check()?;
        let delay = self
            .next_put_delay_ms
            .swap(0, std::sync::atomic::Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.put(document).await
    }

    async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        self.check()?;
        self.inner.delete(detector_id).await
    }

    async fn list(&self) -> Result<Vec<DetectorId>> {
        self.check()?;
        self.inner.list().await
    }

    async fn delete_older_than(&self, cutoff_millis: i64) -> Result<Vec<DetectorId>> {
        self.check()?;
        self.inner.delete_older_than(cutoff_millis).await
    }
}
