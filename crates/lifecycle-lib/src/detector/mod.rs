//! Detector definitions and per-detector state
//!
//! This module provides:
//! - The `DetectorStore` boundary to the detector-definition store
//! - In-memory and file-backed stores
//! - `DetectorEvent`, the update/delete notifications consumed by the node
//! - `Tombstones`, deletions awaiting cluster-wide checkpoint cleanup
//! - `DetectorStateManager`, the TTL cache of configuration and health

mod state;
mod store;

pub use state::{DetectorError, DetectorStateManager, StateConfig};
pub use store::{FileDetectorStore, InMemoryDetectorStore};

use crate::error::Result;
use crate::models::{DetectorConfig, DetectorId};
use async_trait::async_trait;
use dashmap::DashMap;

/// Read/write access to detector definitions
#[async_trait]
pub trait DetectorStore: Send + Sync {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<DetectorConfig>>;

    async fn put(&self, config: DetectorConfig) -> Result<()>;

    /// Returns whether the detector existed
    async fn delete(&self, detector_id: &DetectorId) -> Result<bool>;

    async fn list(&self) -> Result<Vec<DetectorId>>;
}

/// Changes to detector definitions
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Updated(DetectorId),
    Deleted(DetectorId),
}

impl DetectorEvent {
    pub fn detector_id(&self) -> &DetectorId {
        match self {
            DetectorEvent::Updated(id) | DetectorEvent::Deleted(id) => id,
        }
    }
}

/// Detectors deleted since the last daily reconciliation
#[derive(Debug, Default)]
pub struct Tombstones {
    /// detector id -> deletion time (unix millis)
    deleted: DashMap<DetectorId, i64>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, detector_id: DetectorId) {
        self.deleted
            .insert(detector_id, chrono::Utc::now().timestamp_millis());
    }

    pub fn contains(&self, detector_id: &DetectorId) -> bool {
        self.deleted.contains_key(detector_id)
    }

    /// Current tombstones, without removing them
    pub fn snapshot(&self) -> Vec<DetectorId> {
        self.deleted.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self, detector_ids: &[DetectorId]) {
        for id in detector_ids {
            self.deleted.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }
}
