//! Checksummed, TTL-aware access to a checkpoint store

use super::{CheckpointDocument, CheckpointStore};
use crate::error::{LifecycleError, Result};
use crate::models::DetectorId;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Current checkpoint layout
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Checkpoint settings
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Checkpoints older than this are never loaded and are purged daily
    pub ttl: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

/// A verified checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub detector_id: DetectorId,
    pub model: Vec<u8>,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct CheckpointAdapter {
    store: Arc<dyn CheckpointStore>,
    ttl: Duration,
}

impl CheckpointAdapter {
    pub fn new(store: Arc<dyn CheckpointStore>, config: &CheckpointConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist a serialized model pair
    pub async fn save(&self, detector_id: &DetectorId, model: &[u8], updated_at: i64) -> Result<()> {
        let document = CheckpointDocument {
            detector_id: detector_id.clone(),
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: hex::encode(model),
            checksum: checksum(model),
            updated_at,
        };
        self.store.put(document).await?;
        debug!(detector_id = %detector_id, bytes = model.len(), "Checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint for a detector
    ///
    /// Expired and corrupt checkpoints are reported as missing. Only store
    /// outages surface as errors.
    pub async fn load(&self, detector_id: &DetectorId) -> Result<Option<Checkpoint>> {
        let document = match self.store.get(detector_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e @ LifecycleError::CheckpointCorrupt { .. }) => {
                warn!(detector_id = %detector_id, error = %e, "Ignoring corrupt checkpoint");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let cutoff = cutoff_millis(self.ttl);
        if document.updated_at < cutoff {
            debug!(
                detector_id = %detector_id,
                updated_at = document.updated_at,
                "Ignoring expired checkpoint"
            );
            return Ok(None);
        }

        match verify(document) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(detector_id = %detector_id, error = %e, "Ignoring corrupt checkpoint");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, detector_id: &DetectorId) -> Result<bool> {
        self.store.delete(detector_id).await
    }

    /// Detectors with a stored checkpoint, expired or not
    pub async fn list(&self) -> Result<Vec<DetectorId>> {
        self.store.list().await
    }

    /// Purge every checkpoint last updated more than `ttl` ago
    pub async fn delete_older_than(&self, ttl: Duration) -> Result<Vec<DetectorId>> {
        self.store.delete_older_than(cutoff_millis(ttl)).await
    }
}

impl std::fmt::Debug for CheckpointAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointAdapter")
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn checksum(model: &[u8]) -> String {
    hex::encode(Sha256::digest(model))
}

fn cutoff_millis(ttl: Duration) -> i64 {
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_sub(ttl_millis)
}

fn verify(document: CheckpointDocument) -> Result<Checkpoint> {
    let corrupt = |reason: String| LifecycleError::CheckpointCorrupt {
        detector_id: document.detector_id.clone(),
        reason,
    };

    if document.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {}",
            document.format_version
        )));
    }

    let model = hex::decode(&document.model).map_err(|e| corrupt(e.to_string()))?;
    let actual = checksum(&model);
    if actual != document.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: expected {}, got {}",
            document.checksum, actual
        )));
    }

    Ok(Checkpoint {
        detector_id: document.detector_id,
        model,
        updated_at: document.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn adapter_with(store: Arc<InMemoryCheckpointStore>, ttl: Duration) -> CheckpointAdapter {
        CheckpointAdapter::new(store, &CheckpointConfig { ttl })
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let adapter = adapter_with(store, Duration::from_secs(3600));
        let id = DetectorId::new("d1");
        let ts = now();

        adapter.save(&id, b"model-bytes", ts).await.unwrap();
        let checkpoint = adapter.load(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.model, b"model-bytes");
        assert_eq!(checkpoint.updated_at, ts);
    }

    #[tokio::test]
    async fn test_expired_checkpoint_is_missing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_secs(60));
        let id = DetectorId::new("d1");

        adapter.save(&id, b"old", now() - 61_000).await.unwrap();
        assert!(adapter.load(&id).await.unwrap().is_none());
        // Still present until the purge runs
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_load_after_purge_is_missing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_secs(3600));
        let stale = DetectorId::new("stale");
        let fresh = DetectorId::new("fresh");

        adapter.save(&stale, b"a", now() - 7_200_000).await.unwrap();
        adapter.save(&fresh, b"b", now()).await.unwrap();

        let purged = adapter
            .delete_older_than(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(purged, vec![stale.clone()]);
        assert!(adapter.load(&stale).await.unwrap().is_none());
        assert!(adapter.load(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_missing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_secs(3600));
        let id = DetectorId::new("d1");

        store
            .put(CheckpointDocument {
                detector_id: id.clone(),
                format_version: CHECKPOINT_FORMAT_VERSION,
                model: hex::encode(b"tampered"),
                checksum: checksum(b"original"),
                updated_at: now(),
            })
            .await
            .unwrap();

        assert!(adapter.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_format_version_is_missing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_secs(3600));
        let id = DetectorId::new("d1");

        store
            .put(CheckpointDocument {
                detector_id: id.clone(),
                format_version: 99,
                model: hex::encode(b"m"),
                checksum: checksum(b"m"),
                updated_at: now(),
            })
            .await
            .unwrap();

        assert!(adapter.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error() {
        let store = Arc::new(crate::checkpoint::FlakyCheckpointStore::default());
        let adapter = CheckpointAdapter::new(store.clone(), &CheckpointConfig::default());
        store.set_failing(true);

        let result = adapter.load(&DetectorId::new("d1")).await;
        assert!(matches!(result, Err(LifecycleError::StoreUnavailable(_))));
    }
}
