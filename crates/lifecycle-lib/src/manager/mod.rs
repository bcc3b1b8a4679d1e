//! Model lifecycle: scoring, cold start, eviction and handoff
//!
//! This module provides:
//! - `ModelCache`, the memory-bounded map of resident model pairs
//! - `ColdStartRunner`, the bounded pool that trains or restores models
//! - `ModelTrainer`, the cold-start job itself
//! - `ModelManager`, the entry point used by the node

mod cache;
mod coldstart;
mod trainer;

#[cfg(test)]
mod tests;

pub use cache::{CacheConfig, EvictionReason, ModelCache};
pub use coldstart::{ColdStartConfig, ColdStartOutcome, ColdStartRunner, ColdStartTask, SubmitOutcome};
pub use trainer::ModelTrainer;

use crate::checkpoint::CheckpointAdapter;
use crate::detector::{DetectorEvent, DetectorStateManager, DetectorStore, Tombstones};
use crate::error::{LifecycleError, Result};
use crate::features::{self, FeatureSource};
use crate::model::ModelFactory;
use crate::models::{AnomalyResult, DetectorId, FeatureVector, ModelSummary, NodeId};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use crate::ring::HashRing;
use crate::stats::{StatName, Stats};
use cache::CacheLookup;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Collaborators shared by the manager and its cold-start jobs
pub struct ManagerParts {
    pub checkpoints: CheckpointAdapter,
    pub state: Arc<DetectorStateManager>,
    pub features: Arc<dyn FeatureSource>,
    pub factory: Arc<dyn ModelFactory>,
    pub tombstones: Arc<Tombstones>,
    pub ring: watch::Receiver<Arc<HashRing>>,
    pub stats: Stats,
    pub metrics: LifecycleMetrics,
    pub logger: StructuredLogger,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub idle_evicted: usize,
    pub checkpointed: usize,
    pub flushes_retried: usize,
    pub state_swept: usize,
}

pub struct ModelManager {
    cache: Arc<ModelCache>,
    runner: ColdStartRunner,
    checkpoints: CheckpointAdapter,
    state: Arc<DetectorStateManager>,
    features: Arc<dyn FeatureSource>,
    tombstones: Arc<Tombstones>,
    ring: watch::Receiver<Arc<HashRing>>,
    stats: Stats,
    metrics: LifecycleMetrics,
}

impl ModelManager {
    /// Build the cache and start the cold-start workers
    pub fn start(cache_config: CacheConfig, cold_start: &ColdStartConfig, parts: ManagerParts) -> Self {
        let cache = Arc::new(ModelCache::new(
            cache_config,
            parts.checkpoints.clone(),
            Arc::clone(&parts.state),
            parts.metrics.clone(),
            parts.logger.clone(),
        ));

        let trainer = Arc::new(ModelTrainer::new(
            Arc::clone(&cache),
            parts.checkpoints.clone(),
            Arc::clone(&parts.features),
            Arc::clone(&parts.state),
            parts.factory,
            parts.metrics.clone(),
            parts.logger,
        ));
        let runner = ColdStartRunner::start(cold_start, trainer);

        Self {
            cache,
            runner,
            checkpoints: parts.checkpoints,
            state: parts.state,
            features: parts.features,
            tombstones: parts.tombstones,
            ring: parts.ring,
            stats: parts.stats,
            metrics: parts.metrics,
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn runner(&self) -> &ColdStartRunner {
        &self.runner
    }

    pub fn state(&self) -> &Arc<DetectorStateManager> {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointAdapter {
        &self.checkpoints
    }

    /// Latest ring; never blocks on membership updates
    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.borrow())
    }

    pub fn owner_of(&self, detector_id: &DetectorId) -> Result<NodeId> {
        self.ring().owner_of(detector_id)
    }

    /// Score one feature vector for a detector owned by this node
    ///
    /// A detector without a resident model answers `NotReady` and gets a
    /// cold start queued.
    pub async fn score(&self, detector_id: &DetectorId, features: FeatureVector) -> Result<AnomalyResult> {
        self.stats.increment(StatName::ExecuteRequestCount);
        let started = Instant::now();

        let result = self.score_local(detector_id, features).await;
        match &result {
            Ok(_) => self.metrics.observe_score_latency(started.elapsed()),
            Err(LifecycleError::NotReady(_)) => {}
            Err(e) => {
                self.stats.increment(StatName::ExecuteFailureCount);
                debug!(detector_id = %detector_id, error = %e, "Scoring failed");
            }
        }
        result
    }

    async fn score_local(&self, detector_id: &DetectorId, features: FeatureVector) -> Result<AnomalyResult> {
        let ring = self.ring();
        let owner = ring.owner_of(detector_id)?;
        if owner != *ring.local_node() {
            return Err(LifecycleError::NotOwner {
                detector_id: detector_id.clone(),
                owner,
            });
        }

        let config = self.state.get_detector_config(detector_id).await?;
        features::validate(&config, &features)?;
        if let Err(e) = self.state.check_health(detector_id) {
            // History keeps accumulating so the retry after cooldown can train
            if !self.cache.contains(detector_id) {
                self.features.observe(detector_id, &features);
            }
            return Err(e);
        }

        let lookup = self
            .cache
            .score(detector_id, features.values(), config.dimensions())
            .await
            .map_err(|e| LifecycleError::InvalidFeatures(e.to_string()))?;

        match lookup {
            CacheLookup::Scored(score) => Ok(AnomalyResult {
                detector_id: detector_id.clone(),
                score: score.score,
                grade: score.grade,
                confidence: score.confidence,
                scored_at: chrono::Utc::now().timestamp_millis(),
            }),
            CacheLookup::Stale => {
                info!(detector_id = %detector_id, "Detector shape changed, retraining");
                self.cache.discard(detector_id).await;
                if let Err(e) = self.checkpoints.delete(detector_id).await {
                    warn!(detector_id = %detector_id, error = %e, "Failed to delete stale checkpoint");
                }
                self.on_miss(detector_id, &features)
            }
            CacheLookup::Miss => self.on_miss(detector_id, &features),
        }
    }

    fn on_miss(&self, detector_id: &DetectorId, features: &FeatureVector) -> Result<AnomalyResult> {
        self.features.observe(detector_id, features);
        match self.runner.submit(detector_id) {
            SubmitOutcome::Accepted => debug!(detector_id = %detector_id, "Queued cold start"),
            SubmitOutcome::AlreadyPending => {}
            SubmitOutcome::Rejected => {
                warn!(detector_id = %detector_id, "Cold start rejected, will retry on a later request")
            }
        }
        Err(LifecycleError::NotReady(detector_id.clone()))
    }

    /// Evict one model, saving its checkpoint first
    pub async fn evict(&self, detector_id: &DetectorId) -> bool {
        self.cache.evict(detector_id, EvictionReason::Requested).await
    }

    /// Save every resident model; returns `(saved, failed)`
    pub async fn flush_all(&self) -> (usize, usize) {
        let (saved, failed) = self.cache.flush_all().await;
        info!(saved, failed, "Flushed resident models");
        (saved, failed)
    }

    /// Drop a detector's model and checkpoint without saving
    pub async fn stop_detector(&self, detector_id: &DetectorId) -> Result<bool> {
        let was_resident = self.cache.discard(detector_id).await;
        self.checkpoints.delete(detector_id).await?;
        self.state.clear_error(detector_id);
        info!(detector_id = %detector_id, was_resident, "Stopped detector");
        Ok(was_resident)
    }

    /// Apply a detector-definition change
    pub async fn on_detector_event(&self, event: DetectorEvent) -> Result<()> {
        match event {
            DetectorEvent::Updated(detector_id) => {
                debug!(detector_id = %detector_id, "Detector updated");
                self.state.invalidate(&detector_id);
                Ok(())
            }
            DetectorEvent::Deleted(detector_id) => {
                self.cache.discard(&detector_id).await;
                self.state.remove(&detector_id);
                self.features.forget(&detector_id);
                self.tombstones.insert(detector_id.clone());
                if let Err(e) = self.checkpoints.delete(&detector_id).await {
                    warn!(detector_id = %detector_id, error = %e, "Checkpoint delete deferred to daily reconciliation");
                }
                info!(detector_id = %detector_id, "Detector deleted");
                Ok(())
            }
        }
    }

    /// Finish deletions recorded since the last reconciliation
    ///
    /// Every node drops residual local state; only `cluster_wide` callers
    /// delete the residual checkpoints. Returns the number reconciled.
    pub async fn reconcile_deleted(&self, cluster_wide: bool) -> Result<usize> {
        let deleted = self.tombstones.snapshot();
        for detector_id in &deleted {
            self.cache.discard(detector_id).await;
            self.state.remove(detector_id);
            self.features.forget(detector_id);
            if cluster_wide {
                self.checkpoints.delete(detector_id).await?;
            }
        }
        self.tombstones.clear(&deleted);
        Ok(deleted.len())
    }

    /// Delete checkpoints whose detector no longer exists
    ///
    /// Catches deletions whose checkpoint delete failed on a node that
    /// does not reconcile checkpoints. Returns the number deleted.
    pub async fn purge_orphaned_checkpoints(&self) -> Result<usize> {
        let detectors = self.state.store();
        let mut purged = 0;
        for detector_id in self.checkpoints.list().await? {
            if detectors.get(&detector_id).await?.is_some() {
                continue;
            }
            if self.checkpoints.delete(&detector_id).await? {
                debug!(detector_id = %detector_id, "Deleted checkpoint of removed detector");
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub fn resident_models(&self) -> Vec<ModelSummary> {
        self.cache.summaries()
    }

    /// Hourly upkeep: idle eviction, periodic checkpoints, flush retries, state sweep
    pub async fn maintenance(&self) -> MaintenanceReport {
        let config = self.cache.config().clone();
        let report = MaintenanceReport {
            idle_evicted: self.cache.evict_idle(config.model_idle_ttl).await,
            checkpointed: self.cache.checkpoint_active(config.checkpoint_interval).await,
            flushes_retried: self.cache.retry_pending_flushes().await,
            state_swept: self.state.maintenance(),
        };
        info!(
            idle_evicted = report.idle_evicted,
            checkpointed = report.checkpointed,
            flushes_retried = report.flushes_retried,
            state_swept = report.state_swept,
            pending_flushes = self.cache.pending_flush_count(),
            "Model maintenance finished"
        );
        report
    }

    /// Evict models this node no longer owns under `ring`
    ///
    /// An empty ring hands nothing off; models stay until an owner exists.
    pub async fn handoff(&self, ring: &HashRing) -> usize {
        if ring.is_empty() {
            return 0;
        }

        let mut handed_off = 0;
        for detector_id in self.cache.resident_ids() {
            let owned = ring.is_local(&detector_id).unwrap_or(true);
            if !owned && self.cache.evict(&detector_id, EvictionReason::Handoff).await {
                handed_off += 1;
            }
        }
        handed_off
    }

    /// Background watermark evictor
    pub async fn run_evictor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.cache.config().evictor_interval;
        info!(interval_ms = period.as_millis() as u64, "Starting watermark evictor");
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cache.evict_to_watermark().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down watermark evictor");
                    break;
                }
            }
        }
    }

    /// Stop cold starts and checkpoint every resident model
    pub async fn shutdown(&self) -> usize {
        self.runner.shutdown().await;
        let evicted = self.cache.evict_all(EvictionReason::Shutdown).await;
        if self.cache.pending_flush_count() > 0 {
            self.cache.retry_pending_flushes().await;
        }
        evicted
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("cache", &self.cache)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
