//! Per-detector state cache
//!
//! Caches detector configuration read through from the detector store,
//! together with the last error and last checkpoint time. Entries are
//! bounded by `state_ttl` and swept by the hourly maintenance.

use super::DetectorStore;
use crate::error::{LifecycleError, Result};
use crate::models::{DetectorConfig, DetectorId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StateConfig {
    /// How long cached configuration and idle entries live
    pub state_ttl: Duration,
    /// How long a reported error keeps the detector unhealthy
    pub error_cooldown: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(3600),
            error_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Last error reported for a detector
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorError {
    pub reason: String,
    /// Unix millis
    pub occurred_at: i64,
}

#[derive(Debug)]
struct StateEntry {
    config: Option<(DetectorConfig, Instant)>,
    last_error: Option<(DetectorError, Instant)>,
    last_checkpoint: Option<i64>,
    last_access: Instant,
}

impl StateEntry {
    fn new() -> Self {
        Self {
            config: None,
            last_error: None,
            last_checkpoint: None,
            last_access: Instant::now(),
        }
    }
}

pub struct DetectorStateManager {
    store: Arc<dyn DetectorStore>,
    entries: DashMap<DetectorId, StateEntry>,
    config: StateConfig,
}

impl DetectorStateManager {
    pub fn new(store: Arc<dyn DetectorStore>, config: StateConfig) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn DetectorStore> {
        &self.store
    }

    /// Detector configuration, loaded from the store when missing or expired
    pub async fn get_detector_config(&self, detector_id: &DetectorId) -> Result<DetectorConfig> {
        if let Some(mut entry) = self.entries.get_mut(detector_id) {
            entry.last_access = Instant::now();
            if let Some((config, loaded_at)) = &entry.config {
                if loaded_at.elapsed() < self.config.state_ttl {
                    return Ok(config.clone());
                }
            }
        }

        let config = self
            .store
            .get(detector_id)
            .await?
            .ok_or_else(|| LifecycleError::DetectorNotFound(detector_id.clone()))?;

        debug!(detector_id = %detector_id, "Loaded detector configuration");
        let mut entry = self
            .entries
            .entry(detector_id.clone())
            .or_insert_with(StateEntry::new);
        entry.config = Some((config.clone(), Instant::now()));
        entry.last_access = Instant::now();
        Ok(config)
    }

    /// Mark a detector unhealthy for the error cooldown
    pub fn report_error(&self, detector_id: &DetectorId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(detector_id = %detector_id, reason = %reason, "Detector error reported");

        let mut entry = self
            .entries
            .entry(detector_id.clone())
            .or_insert_with(StateEntry::new);
        entry.last_error = Some((
            DetectorError {
                reason,
                occurred_at: chrono::Utc::now().timestamp_millis(),
            },
            Instant::now(),
        ));
    }

    /// `Unhealthy` while a reported error is within its cooldown
    pub fn check_health(&self, detector_id: &DetectorId) -> Result<()> {
        let Some(entry) = self.entries.get(detector_id) else {
            return Ok(());
        };
        match &entry.last_error {
            Some((error, at)) if at.elapsed() < self.config.error_cooldown => {
                Err(LifecycleError::Unhealthy {
                    detector_id: detector_id.clone(),
                    reason: error.reason.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn last_error(&self, detector_id: &DetectorId) -> Option<DetectorError> {
        self.entries
            .get(detector_id)
            .and_then(|e| e.last_error.as_ref().map(|(err, _)| err.clone()))
    }

    pub fn clear_error(&self, detector_id: &DetectorId) {
        if let Some(mut entry) = self.entries.get_mut(detector_id) {
            entry.last_error = None;
        }
    }

    pub fn record_checkpoint(&self, detector_id: &DetectorId, updated_at: i64) {
        let mut entry = self
            .entries
            .entry(detector_id.clone())
            .or_insert_with(StateEntry::new);
        entry.last_checkpoint = Some(updated_at);
    }

    pub fn last_checkpoint(&self, detector_id: &DetectorId) -> Option<i64> {
        self.entries.get(detector_id).and_then(|e| e.last_checkpoint)
    }

    /// Drop cached configuration so the next read goes to the store
    pub fn invalidate(&self, detector_id: &DetectorId) {
        if let Some(mut entry) = self.entries.get_mut(detector_id) {
            entry.config = None;
        }
    }

    /// Forget everything about a detector
    pub fn remove(&self, detector_id: &DetectorId) {
        self.entries.remove(detector_id);
    }

    /// Sweep expired state; returns the number of entries removed
    pub fn maintenance(&self) -> usize {
        let ttl = self.config.state_ttl;
        let cooldown = self.config.error_cooldown;
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            if matches!(&entry.last_error, Some((_, at)) if at.elapsed() >= cooldown) {
                entry.last_error = None;
            }
            if matches!(&entry.config, Some((_, loaded_at)) if loaded_at.elapsed() >= ttl) {
                entry.config = None;
            }
            entry.last_error.is_some() || entry.last_access.elapsed() < ttl
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept expired detector state");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DetectorStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorStateManager")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}
