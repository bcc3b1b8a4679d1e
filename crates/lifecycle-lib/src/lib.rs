//! Distributed model lifecycle manager for anomaly detectors
//!
//! This crate provides the core functionality for:
//! - Detector ownership via a consistent-hash ring over cluster membership
//! - A memory-bounded cache of live model pairs with checkpointed eviction
//! - Cold-start training and warm start from checkpoints
//! - Detector state caching, maintenance crons and execution stats
//! - Health checks and observability

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod cron;
pub mod detector;
pub mod error;
pub mod features;
pub mod health;
pub mod manager;
pub mod model;
pub mod models;
pub mod observability;
pub mod ring;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::LifecycleConfig;
pub use error::{LifecycleError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{LifecycleMetrics, StructuredLogger};
pub use stats::{ClusterStats, NodeStats, StatName, Stats};

use checkpoint::{CheckpointAdapter, CheckpointStore};
use cluster::{ClusterEventListener, MembershipHandle};
use cron::{DailyCron, HourlyCron};
use detector::{DetectorEvent, DetectorStateManager, DetectorStore, Tombstones};
use features::FeatureSource;
use health::components;
use manager::{ManagerParts, ModelManager};
use model::ModelFactory;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External collaborators wired into a lifecycle
pub struct Collaborators {
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub detector_store: Arc<dyn DetectorStore>,
    pub features: Arc<dyn FeatureSource>,
    pub factory: Arc<dyn ModelFactory>,
}

/// Handle set returned by the composition root
pub struct Lifecycle {
    pub node_id: NodeId,
    pub manager: Arc<ModelManager>,
    pub membership: MembershipHandle,
    pub detectors: Arc<dyn DetectorStore>,
    pub stats: Stats,
    pub metrics: LifecycleMetrics,
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    /// Validate configuration, wire every component and start background tasks
    pub async fn build(
        node_id: NodeId,
        initial_membership: MembershipSnapshot,
        config: LifecycleConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let metrics =
            LifecycleMetrics::new().map_err(|e| LifecycleError::Config(e.to_string()))?;
        let logger = StructuredLogger::new(node_id.as_str());
        let stats = Stats::new();
        let health = HealthRegistry::new();
        for name in components::ALL {
            health.register(name).await;
        }
        if initial_membership.nodes.is_empty() {
            health
                .set_unhealthy(components::HASH_RING, "membership is empty")
                .await;
        }

        let (ring_tx, ring_rx) =
            cluster::ring_channel(&initial_membership, node_id.clone(), &config.ring);

        let checkpoints = CheckpointAdapter::new(collaborators.checkpoint_store, &config.checkpoint);
        let state = Arc::new(DetectorStateManager::new(
            Arc::clone(&collaborators.detector_store),
            config.state.clone(),
        ));

        let manager = Arc::new(ModelManager::start(
            config.cache.clone(),
            &config.cold_start,
            ManagerParts {
                checkpoints,
                state,
                features: collaborators.features,
                factory: collaborators.factory,
                tombstones: Arc::new(Tombstones::new()),
                ring: ring_rx,
                stats: stats.clone(),
                metrics: metrics.clone(),
                logger: logger.clone(),
            },
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let (membership, events) = ClusterEventListener::channel(64);
        let listener = ClusterEventListener::new(
            initial_membership,
            node_id.clone(),
            config.ring.clone(),
            ring_tx,
            Arc::clone(&manager),
            health.clone(),
            metrics.clone(),
            logger.clone(),
        );

        let tasks = vec![
            tokio::spawn(listener.run(events, shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&manager).run_evictor(shutdown_tx.subscribe())),
            tokio::spawn(
                HourlyCron::new(Arc::clone(&manager), &config.cron).run(shutdown_tx.subscribe()),
            ),
            tokio::spawn(
                DailyCron::new(
                    Arc::clone(&manager),
                    config.checkpoint.ttl,
                    &config.cron,
                    logger.clone(),
                )
                .run(shutdown_tx.subscribe()),
            ),
        ];

        health.set_ready(true).await;
        info!(node = %node_id, "Lifecycle started");

        Ok(Self {
            node_id,
            manager,
            membership,
            detectors: collaborators.detector_store,
            stats,
            metrics,
            health,
            logger,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Local stats snapshot
    pub fn node_stats(&self) -> NodeStats {
        self.stats.snapshot(&self.node_id)
    }

    /// Store a detector definition and apply the update
    pub async fn put_detector(&self, config: DetectorConfig) -> Result<()> {
        let detector_id = config.detector_id.clone();
        self.detectors.put(config).await?;
        self.manager
            .on_detector_event(DetectorEvent::Updated(detector_id))
            .await
    }

    /// Remove a detector definition and apply the deletion
    pub async fn delete_detector(&self, detector_id: &DetectorId) -> Result<bool> {
        let existed = self.detectors.delete(detector_id).await?;
        self.manager
            .on_detector_event(DetectorEvent::Deleted(detector_id.clone()))
            .await?;
        Ok(existed)
    }

    /// Recompute component health from current lifecycle state
    pub async fn refresh_health(&self) {
        let cache = self.manager.cache();
        let high = cache.budget_bytes() as f64 * cache.config().high_watermark;
        if cache.used_bytes() as f64 > high {
            self.health
                .set_degraded(components::MODEL_CACHE, "usage above high watermark")
                .await;
        } else {
            self.health.set_healthy(components::MODEL_CACHE).await;
        }

        let pending = cache.pending_flush_count();
        if pending > 0 {
            self.health
                .set_degraded(
                    components::CHECKPOINT_STORE,
                    format!("{} checkpoint saves pending retry", pending),
                )
                .await;
        } else {
            self.health.set_healthy(components::CHECKPOINT_STORE).await;
        }

        if self.manager.ring().is_empty() {
            self.health
                .set_unhealthy(components::HASH_RING, "membership is empty")
                .await;
        } else {
            self.health.set_healthy(components::HASH_RING).await;
        }

        let runner = self.manager.runner();
        if runner.is_saturated() {
            self.health
                .set_degraded(
                    components::COLD_START,
                    format!("cold-start queue full ({} pending)", runner.pending_len()),
                )
                .await;
        } else {
            self.health.set_healthy(components::COLD_START).await;
        }
    }

    /// Stop background tasks and checkpoint every resident model
    pub async fn shutdown(&self) -> usize {
        self.health.set_ready(false).await;
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in tasks {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task panicked");
            }
        }

        self.manager.shutdown().await
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("node_id", &self.node_id)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
