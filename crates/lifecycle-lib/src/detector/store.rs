//! Detector definition stores

use super::DetectorStore;
use crate::error::{LifecycleError, Result};
use crate::models::{DetectorConfig, DetectorId};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct InMemoryDetectorStore {
    detectors: DashMap<DetectorId, DetectorConfig>,
}

impl InMemoryDetectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detectors(configs: impl IntoIterator<Item = DetectorConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.detectors.insert(config.detector_id.clone(), config);
        }
        store
    }
}

#[async_trait]
impl DetectorStore for InMemoryDetectorStore {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<DetectorConfig>> {
        Ok(self.detectors.get(detector_id).map(|c| c.clone()))
    }

    async fn put(&self, config: DetectorConfig) -> Result<()> {
        self.detectors.insert(config.detector_id.clone(), config);
        Ok(())
    }

    async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        Ok(self.detectors.remove(detector_id).is_some())
    }

    async fn list(&self) -> Result<Vec<DetectorId>> {
        Ok(self.detectors.iter().map(|e| e.key().clone()).collect())
    }
}

/// Detector definitions kept as JSON files in a directory
///
/// Definitions are read on every `get`; the state manager in front of the
/// store provides caching.
#[derive(Debug, Clone)]
pub struct FileDetectorStore {
    dir: PathBuf,
}

impl FileDetectorStore {
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create detector directory {:?}", dir))?;
        info!(dir = %dir.display(), "Using file detector store");
        Ok(Self { dir })
    }

    fn path_for(&self, detector_id: &DetectorId) -> PathBuf {
        self.dir
            .join(format!("{}.json", hex::encode(detector_id.as_str())))
    }

    async fn write_config(&self, config: &DetectorConfig) -> anyhow::Result<()> {
        let path = self.path_for(&config.detector_id);
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(config).context("Failed to serialize detector")?;

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {:?}", temp_path))?;
        file.write_all(&json).await.context("Failed to write detector")?;
        file.sync_all().await.context("Failed to sync detector")?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }
}

fn unavailable(e: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::StoreUnavailable(format!("detector store: {:#}", e))
}

#[async_trait]
impl DetectorStore for FileDetectorStore {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<DetectorConfig>> {
        let path = self.path_for(detector_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };

        match serde_json::from_slice(&data) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!(detector_id = %detector_id, error = %e, "Unreadable detector definition");
                Err(unavailable(e))
            }
        }
    }

    async fn put(&self, config: DetectorConfig) -> Result<()> {
        self.write_config(&config).await.map_err(unavailable)
    }

    async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        match fs::remove_file(self.path_for(detector_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn list(&self) -> Result<Vec<DetectorId>> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(unavailable)?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
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
                None => warn!(path = %path.display(), "Skipping unrecognised detector file"),
            }
        }

        Ok(ids)
    }
}
