//! Checkpoint persistence
//!
//! This module provides:
//! - The `CheckpointStore` capability: document get/put/delete/list by
//!   detector id plus a predicate delete on the last-updated timestamp
//! - In-memory and file-backed stores
//! - `CheckpointAdapter`, which adds checksums, format versioning, TTL
//!   filtering and corrupt-as-missing semantics on top of any store

mod adapter;
mod store;

pub use adapter::{Checkpoint, CheckpointAdapter, CheckpointConfig, CHECKPOINT_FORMAT_VERSION};
pub use store::{FileCheckpointStore, InMemoryCheckpointStore};

#[cfg(test)]
pub(crate) use store::FlakyCheckpointStore;

use crate::error::Result;
use crate::models::DetectorId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Durable document holding one serialized model pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub detector_id: DetectorId,
    pub format_version: u32,
    /// Hex-encoded model blob
    pub model: String,
    /// SHA-256 of the raw model blob, hex
    pub checksum: String,
    /// Unix millis
    pub updated_at: i64,
}

/// Key-value persistence for checkpoint documents
///
/// Implementations only guarantee single-document atomicity.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, detector_id: &DetectorId) -> Result<Option<CheckpointDocument>>;

    async fn put(&self, document: CheckpointDocument) -> Result<()>;

    /// Returns whether a document existed
    async fn delete(&self, detector_id: &DetectorId) -> Result<bool>;

    /// Ids of every stored document
    async fn list(&self) -> Result<Vec<DetectorId>>;

    /// Delete every document last updated before `cutoff_millis`
    async fn delete_older_than(&self, cutoff_millis: i64) -> Result<Vec<DetectorId>>;
}
