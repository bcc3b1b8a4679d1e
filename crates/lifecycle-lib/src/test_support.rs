//! Shared fixtures for manager, cron and cluster tests

use crate::checkpoint::{CheckpointAdapter, CheckpointConfig, FlakyCheckpointStore};
use crate::cluster;
use crate::detector::{DetectorStateManager, DetectorStore, InMemoryDetectorStore, StateConfig, Tombstones};
use crate::features::ObservedFeatureSource;
use crate::manager::{CacheConfig, ColdStartConfig, ManagerParts, ModelManager};
use crate::model::{DefaultModelFactory, ModelFactory, ModelFactoryConfig};
use crate::models::fixtures::detector_config;
use crate::models::{DetectorConfig, DetectorId, FeatureVector, MembershipSnapshot, NodeId};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use crate::ring::{HashRing, RingConfig};
use crate::stats::Stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub(crate) fn factory_config() -> ModelFactoryConfig {
    ModelFactoryConfig {
        threshold_min_samples: 4,
        min_training_samples: 16,
        ..Default::default()
    }
}

/// Two features with a shingle of two: four dimensions
pub(crate) fn config_for(id: &str) -> DetectorConfig {
    detector_config(id, 2, 2)
}

/// Bytes one test model occupies in the cache
pub(crate) fn model_size() -> usize {
    DefaultModelFactory::new(factory_config()).estimated_size(&config_for("sizing"))
}

/// Cache whose budget fits exactly `models` test models
pub(crate) fn cache_for(models: usize) -> CacheConfig {
    CacheConfig {
        memory_limit_bytes: (model_size() * models) as u64,
        model_max_size_percentage: 1.0,
        high_watermark: 1.0,
        low_watermark: 0.5,
        ..Default::default()
    }
}

pub(crate) fn sample(i: usize) -> Vec<f64> {
    let t = i as f64;
    vec![(t * 0.7).sin(), (t * 1.3).cos(), 1.0 + (t * 0.1).sin(), 0.5]
}

pub(crate) fn vector(i: usize) -> FeatureVector {
    FeatureVector::new(sample(i))
}

pub(crate) fn membership(version: u64, nodes: &[&str]) -> MembershipSnapshot {
    MembershipSnapshot::new(version, nodes.iter().map(|n| NodeId::new(*n)))
}

/// Poll `condition` until it holds; panics after two seconds
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

pub(crate) struct HarnessBuilder {
    local: NodeId,
    membership: MembershipSnapshot,
    cache: CacheConfig,
    store: Option<Arc<FlakyCheckpointStore>>,
    detectors: Option<Arc<InMemoryDetectorStore>>,
    factory: Option<Arc<dyn ModelFactory>>,
    checkpoint_ttl: Duration,
    error_cooldown: Duration,
}

impl HarnessBuilder {
    pub fn members(mut self, membership: MembershipSnapshot) -> Self {
        self.membership = membership;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Share a checkpoint store with another harness
    pub fn store(mut self, store: Arc<FlakyCheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share detector definitions with another harness
    pub fn detectors(mut self, detectors: Arc<InMemoryDetectorStore>) -> Self {
        self.detectors = Some(detectors);
        self
    }

    pub fn error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn checkpoint_ttl(mut self, ttl: Duration) -> Self {
        self.checkpoint_ttl = ttl;
        self
    }

    pub fn build(self) -> Harness {
        let store = self.store.unwrap_or_default();
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultModelFactory::new(factory_config())));
        let detectors = self.detectors.unwrap_or_default();
        let features = Arc::new(ObservedFeatureSource::new(256));
        let tombstones = Arc::new(Tombstones::new());
        let stats = Stats::new();
        let metrics = LifecycleMetrics::new().unwrap();
        let (ring_tx, ring_rx) =
            cluster::ring_channel(&self.membership, self.local.clone(), &RingConfig::default());

        let checkpoints = CheckpointAdapter::new(
            store.clone(),
            &CheckpointConfig {
                ttl: self.checkpoint_ttl,
            },
        );
        let state = Arc::new(DetectorStateManager::new(
            detectors.clone(),
            StateConfig {
                error_cooldown: self.error_cooldown,
                ..Default::default()
            },
        ));

        let manager = Arc::new(ModelManager::start(
            self.cache,
            &ColdStartConfig {
                workers: 2,
                queue_capacity: 16,
            },
            ManagerParts {
                checkpoints,
                state,
                features: features.clone(),
                factory,
                tombstones: tombstones.clone(),
                ring: ring_rx,
                stats: stats.clone(),
                metrics: metrics.clone(),
                logger: StructuredLogger::new(self.local.as_str()),
            },
        ));

        Harness {
            local: self.local,
            manager,
            store,
            detectors,
            features,
            tombstones,
            stats,
            metrics,
            ring_tx,
        }
    }
}

/// A single-node manager over in-memory collaborators
pub(crate) struct Harness {
    pub local: NodeId,
    pub manager: Arc<ModelManager>,
    pub store: Arc<FlakyCheckpointStore>,
    pub detectors: Arc<InMemoryDetectorStore>,
    pub features: Arc<ObservedFeatureSource>,
    pub tombstones: Arc<Tombstones>,
    pub stats: Stats,
    pub metrics: LifecycleMetrics,
    pub ring_tx: watch::Sender<Arc<HashRing>>,
}

impl Harness {
    /// Node `local` alone in the cluster, room for eight models
    pub fn builder(local: &str) -> HarnessBuilder {
        HarnessBuilder {
            local: NodeId::new(local),
            membership: membership(1, &[local]),
            cache: cache_for(8),
            store: None,
            detectors: None,
            factory: None,
            checkpoint_ttl: CheckpointConfig::default().ttl,
            error_cooldown: StateConfig::default().error_cooldown,
        }
    }

    pub fn new(local: &str) -> Harness {
        Self::builder(local).build()
    }

    pub async fn add_detector(&self, id: &str) -> DetectorId {
        let config = config_for(id);
        let detector_id = config.detector_id.clone();
        self.detectors.put(config).await.unwrap();
        detector_id
    }

    pub fn seed_history(&self, detector_id: &DetectorId, count: usize) {
        self.features
            .extend(detector_id, (0..count).map(sample));
    }

    pub async fn wait_resident(&self, detector_id: &DetectorId) {
        let cache = Arc::clone(self.manager.cache());
        wait_until(|| cache.contains(detector_id)).await;
    }

    /// Register a detector with enough history and bring its model up
    ///
    /// Returns once the cold start, including its checkpoint save, is done.
    pub async fn ready(&self, id: &str) -> DetectorId {
        let detector_id = self.add_detector(id).await;
        self.seed_history(&detector_id, 32);
        let first = self.manager.score(&detector_id, vector(0)).await;
        assert!(matches!(first, Err(crate::LifecycleError::NotReady(_))));
        self.wait_resident(&detector_id).await;
        let manager = Arc::clone(&self.manager);
        wait_until(|| !manager.runner().is_pending(&detector_id)).await;
        detector_id
    }

    /// Publish a new membership and return the ring built from it
    pub fn set_membership(&self, snapshot: &MembershipSnapshot) -> Arc<HashRing> {
        let ring = Arc::new(HashRing::build(
            snapshot,
            self.local.clone(),
            &RingConfig::default(),
        ));
        self.ring_tx.send_replace(Arc::clone(&ring));
        ring
    }

    pub fn checkpoints(&self) -> &CheckpointAdapter {
        self.manager.checkpoints()
    }
}

/// First detector id in `prefix-N` form owned by `owner` under `snapshot`
pub(crate) fn detector_owned_by(snapshot: &MembershipSnapshot, owner: &str, prefix: &str) -> String {
    let ring = HashRing::build(snapshot, NodeId::new(owner), &RingConfig::default());
    (0..1000)
        .map(|i| format!("{}-{}", prefix, i))
        .find(|id| ring.is_local(&DetectorId::new(id.as_str())).unwrap())
        .unwrap()
}
