use super::*;
use crate::checkpoint::{CheckpointDocument, CheckpointStore, CHECKPOINT_FORMAT_VERSION};
use crate::detector::DetectorStore;
use crate::model::{DefaultModelFactory, ModelError, ModelPair};
use crate::models::fixtures::detector_config;
use crate::models::{DetectorConfig, MembershipSnapshot};
use crate::test_support::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn trained_pair(id: &str) -> ModelPair {
    let samples: Vec<Vec<f64>> = (0..32).map(sample).collect();
    DefaultModelFactory::new(factory_config())
        .train(&config_for(id), &samples)
        .unwrap()
}

async fn restored_samples(h: &Harness, detector_id: &DetectorId) -> u64 {
    let checkpoint = h.checkpoints().load(detector_id).await.unwrap().unwrap();
    DefaultModelFactory::new(factory_config())
        .deserialize(&checkpoint.model)
        .unwrap()
        .samples_seen()
}

fn resident_samples(h: &Harness, detector_id: &DetectorId) -> u64 {
    h.manager
        .resident_models()
        .into_iter()
        .find(|m| &m.detector_id == detector_id)
        .map(|m| m.samples_seen)
        .unwrap()
}

struct CountingFactory {
    inner: DefaultModelFactory,
    trains: AtomicUsize,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            inner: DefaultModelFactory::new(factory_config()),
            trains: AtomicUsize::new(0),
        }
    }
}

impl ModelFactory for CountingFactory {
    fn min_training_samples(&self) -> usize {
        self.inner.min_training_samples()
    }

    fn estimated_size(&self, config: &DetectorConfig) -> usize {
        self.inner.estimated_size(config)
    }

    fn train(&self, config: &DetectorConfig, samples: &[Vec<f64>]) -> Result<ModelPair, ModelError> {
        self.trains.fetch_add(1, Ordering::SeqCst);
        self.inner.train(config, samples)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<ModelPair, ModelError> {
        self.inner.deserialize(bytes)
    }
}

#[tokio::test]
async fn test_first_request_not_ready_then_scores() {
    let h = Harness::new("node-a");
    let id = h.add_detector("d1").await;
    h.seed_history(&id, 32);

    let first = h.manager.score(&id, vector(100)).await;
    assert!(matches!(first, Err(LifecycleError::NotReady(_))));

    wait_until(|| h.metrics.cold_start_count("trained") == 1).await;
    let result = h.manager.score(&id, vector(101)).await.unwrap();
    assert_eq!(result.detector_id, id);
    assert!(result.score.is_finite());
    assert!((0.0..=1.0).contains(&result.grade));

    assert_eq!(h.stats.get(StatName::ExecuteRequestCount), 2);
    assert_eq!(h.stats.get(StatName::ExecuteFailureCount), 0);
    // The cold start saves the trained model before it reports success
    assert!(h.store.inner.get(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_misses_train_once() {
    let factory = Arc::new(CountingFactory::new());
    let h = Harness::builder("node-a").factory(factory.clone()).build();
    let id = h.add_detector("d1").await;
    h.seed_history(&id, 32);

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = Arc::clone(&h.manager);
        let id = id.clone();
        handles.push(tokio::spawn(async move { manager.score(&id, vector(i)).await }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) | Err(LifecycleError::NotReady(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    wait_until(|| h.metrics.cold_start_count("trained") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.trains.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.cache().len(), 1);
}

#[tokio::test]
async fn test_insufficient_history_enters_cooldown() {
    let h = Harness::new("node-a");
    let id = h.add_detector("d1").await;

    let first = h.manager.score(&id, vector(0)).await;
    assert!(matches!(first, Err(LifecycleError::NotReady(_))));

    let state = Arc::clone(h.manager.state());
    wait_until(|| state.last_error(&id).is_some()).await;
    assert!(state.last_error(&id).unwrap().reason.contains("training"));
    assert_eq!(h.metrics.cold_start_count("failed"), 1);

    let second = h.manager.score(&id, vector(1)).await;
    assert!(matches!(second, Err(LifecycleError::Unhealthy { .. })));
    assert_eq!(h.stats.get(StatName::ExecuteFailureCount), 1);
    assert!(h.manager.cache().is_empty());
    // Vectors rejected during the cooldown still count as history
    assert_eq!(h.features.window_len(&id), 2);
}

#[tokio::test]
async fn test_observed_history_trains_after_cooldown() {
    let h = Harness::builder("node-a")
        .error_cooldown(Duration::from_millis(50))
        .build();
    let id = h.add_detector("d1").await;

    let mut scored = false;
    for i in 0..400 {
        match h.manager.score(&id, vector(i)).await {
            Ok(_) => {
                scored = true;
                break;
            }
            Err(LifecycleError::NotReady(_)) | Err(LifecycleError::Unhealthy { .. }) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert!(scored, "detector never trained from observed vectors");
    assert!(h.metrics.cold_start_count("failed") >= 1);
    wait_until(|| h.metrics.cold_start_count("trained") == 1).await;
}

#[tokio::test]
async fn test_budget_evicts_lru_with_checkpoint() {
    let h = Harness::builder("node-a").cache(cache_for(2)).build();
    let d1 = h.ready("d1").await;
    let d2 = h.ready("d2").await;

    h.manager.score(&d2, vector(40)).await.unwrap();
    h.manager.score(&d1, vector(41)).await.unwrap();
    let d2_seen = resident_samples(&h, &d2);

    let d3 = h.ready("d3").await;

    let cache = h.manager.cache();
    assert!(cache.contains(&d1));
    assert!(!cache.contains(&d2));
    assert!(cache.contains(&d3));
    assert!(cache.used_bytes() <= cache.budget_bytes());
    assert_eq!(h.metrics.eviction_count("memory_pressure"), 1);

    // The eviction save holds every update the model saw
    assert_eq!(restored_samples(&h, &d2).await, d2_seen);
}

#[tokio::test]
async fn test_model_larger_than_budget_fails() {
    let config = CacheConfig {
        memory_limit_bytes: (model_size() / 2) as u64,
        ..cache_for(1)
    };
    let h = Harness::builder("node-a").cache(config).build();
    let id = h.add_detector("d1").await;
    h.seed_history(&id, 32);

    let _ = h.manager.score(&id, vector(0)).await;
    let state = Arc::clone(h.manager.state());
    wait_until(|| state.last_error(&id).is_some()).await;
    assert!(state.last_error(&id).unwrap().reason.contains("budget"));
    assert!(h.manager.cache().is_empty());
}

#[tokio::test]
async fn test_handoff_then_new_owner_warm_starts() {
    let store = Arc::new(crate::checkpoint::FlakyCheckpointStore::default());
    let b = Harness::builder("node-b").store(store.clone()).build();
    let id = b.ready("d1").await;
    b.manager.score(&id, vector(50)).await.unwrap();
    let seen = resident_samples(&b, &id);

    // node-b leaves; its detectors move to node-a
    let ring = b.set_membership(&membership(2, &["node-a"]));
    assert_eq!(b.manager.handoff(&ring).await, 1);
    assert!(!b.manager.cache().contains(&id));
    assert_eq!(b.metrics.eviction_count("handoff"), 1);

    let a = Harness::builder("node-a")
        .members(membership(2, &["node-a"]))
        .store(store)
        .build();
    a.add_detector("d1").await;

    let first = a.manager.score(&id, vector(51)).await;
    assert!(matches!(first, Err(LifecycleError::NotReady(_))));
    wait_until(|| a.metrics.cold_start_count("warm_started") == 1).await;

    assert_eq!(resident_samples(&a, &id), seen);
    assert_eq!(a.metrics.cold_start_count("trained"), 0);
    assert!(a.manager.score(&id, vector(52)).await.is_ok());
}

#[tokio::test]
async fn test_handoff_with_empty_ring_keeps_models() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    let ring = h.set_membership(&MembershipSnapshot::empty());
    assert_eq!(h.manager.handoff(&ring).await, 0);
    assert!(h.manager.cache().contains(&id));

    let result = h.manager.score(&id, vector(1)).await;
    assert!(matches!(result, Err(LifecycleError::ClusterUnavailable)));
}

#[tokio::test]
async fn test_expired_checkpoint_is_not_warm_started() {
    let h = Harness::builder("node-a")
        .checkpoint_ttl(Duration::from_secs(60))
        .build();
    let old = h.add_detector("old").await;
    let fresh = h.add_detector("fresh").await;

    let blob = trained_pair("old").serialize().unwrap();
    h.checkpoints()
        .save(&old, &blob, now_millis() - 61_000)
        .await
        .unwrap();
    h.checkpoints()
        .save(&fresh, &blob, now_millis() - 30_000)
        .await
        .unwrap();
    h.seed_history(&old, 32);

    let _ = h.manager.score(&old, vector(0)).await;
    let _ = h.manager.score(&fresh, vector(0)).await;
    wait_until(|| {
        h.metrics.cold_start_count("trained") == 1 && h.metrics.cold_start_count("warm_started") == 1
    })
    .await;

    assert!(h.manager.cache().contains(&old));
    assert!(h.manager.cache().contains(&fresh));
}

#[tokio::test]
async fn test_corrupt_checkpoint_falls_back_to_training() {
    let h = Harness::new("node-a");
    let tampered = h.add_detector("tampered").await;
    let garbage = h.add_detector("garbage").await;

    h.store
        .inner
        .put(CheckpointDocument {
            detector_id: tampered.clone(),
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: hex::encode(b"model"),
            checksum: "not-a-checksum".to_string(),
            updated_at: now_millis(),
        })
        .await
        .unwrap();
    h.checkpoints()
        .save(&garbage, b"not a model", now_millis())
        .await
        .unwrap();
    h.seed_history(&tampered, 32);
    h.seed_history(&garbage, 32);

    let _ = h.manager.score(&tampered, vector(0)).await;
    let _ = h.manager.score(&garbage, vector(0)).await;
    wait_until(|| h.metrics.cold_start_count("trained") == 2).await;

    assert_eq!(h.metrics.cold_start_count("warm_started"), 0);
    // Retraining replaced both bad checkpoints
    assert!(h.checkpoints().load(&tampered).await.unwrap().is_some());
    assert_eq!(restored_samples(&h, &garbage).await, 33);
}

#[tokio::test]
async fn test_checkpoint_outage_blocks_cold_start() {
    let h = Harness::new("node-a");
    let id = h.add_detector("d1").await;
    h.seed_history(&id, 32);
    h.store.set_failing(true);

    let _ = h.manager.score(&id, vector(0)).await;
    let state = Arc::clone(h.manager.state());
    wait_until(|| state.last_error(&id).is_some()).await;

    assert_eq!(h.metrics.cold_start_count("trained"), 0);
    assert!(h.manager.cache().is_empty());
    let result = h.manager.score(&id, vector(1)).await;
    assert!(matches!(result, Err(LifecycleError::Unhealthy { .. })));
}

#[tokio::test]
async fn test_not_owner_is_rejected_before_any_work() {
    let snapshot = membership(1, &["node-a", "node-b"]);
    let h = Harness::builder("node-a").members(snapshot.clone()).build();
    let remote = detector_owned_by(&snapshot, "node-b", "det");
    let id = h.add_detector(&remote).await;

    match h.manager.score(&id, vector(0)).await {
        Err(LifecycleError::NotOwner { owner, .. }) => assert_eq!(owner, NodeId::new("node-b")),
        other => panic!("expected NotOwner, got {:?}", other),
    }
    assert!(!h.manager.runner().is_pending(&id));
    assert_eq!(h.features.window_len(&id), 0);
    assert_eq!(h.stats.get(StatName::ExecuteFailureCount), 1);
}

#[tokio::test]
async fn test_unhealthy_detector_short_circuits() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    h.manager.state().report_error(&id, "feature query failed");
    let result = h.manager.score(&id, vector(1)).await;
    assert!(matches!(result, Err(LifecycleError::Unhealthy { .. })));
    assert!(h.manager.cache().contains(&id));

    h.manager.state().clear_error(&id);
    assert!(h.manager.score(&id, vector(2)).await.is_ok());
}

#[tokio::test]
async fn test_invalid_features_rejected() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    let short = h.manager.score(&id, FeatureVector::new(vec![1.0, 2.0])).await;
    assert!(matches!(short, Err(LifecycleError::InvalidFeatures(_))));
    let nan = h
        .manager
        .score(&id, FeatureVector::new(vec![1.0, f64::NAN, 0.0, 0.0]))
        .await;
    assert!(matches!(nan, Err(LifecycleError::InvalidFeatures(_))));
    assert_eq!(h.stats.get(StatName::ExecuteFailureCount), 2);
}

#[tokio::test]
async fn test_unknown_detector() {
    let h = Harness::new("node-a");
    let result = h.manager.score(&DetectorId::new("missing"), vector(0)).await;
    assert!(matches!(result, Err(LifecycleError::DetectorNotFound(_))));
}

#[tokio::test]
async fn test_failed_eviction_save_is_retried() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 1);

    h.store.set_failing(true);
    assert!(h.manager.evict(&id).await);
    let cache = h.manager.cache();
    assert!(!cache.contains(&id));
    assert_eq!(cache.used_bytes(), 0);
    assert!(cache.has_pending_flush(&id));

    h.store.set_failing(false);
    let report = h.manager.maintenance().await;
    assert_eq!(report.flushes_retried, 1);
    assert_eq!(cache.pending_flush_count(), 0);
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsaved_eviction_blob_is_restored() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;
    for i in 0..20 {
        h.manager.score(&id, vector(i)).await.unwrap();
    }
    let seen = resident_samples(&h, &id);
    assert!(restored_samples(&h, &id).await < seen);

    h.store.set_failing(true);
    assert!(h.manager.evict(&id).await);
    assert!(h.manager.cache().has_pending_flush(&id));

    // Restored without reading the store, which is still down
    let miss = h.manager.score(&id, vector(100)).await;
    assert!(matches!(miss, Err(LifecycleError::NotReady(_))));
    wait_until(|| h.metrics.cold_start_count("warm_started") == 1).await;
    assert_eq!(resident_samples(&h, &id), seen);
    assert_eq!(h.metrics.cold_start_count("trained"), 0);
    assert!(h.manager.cache().has_pending_flush(&id));

    h.store.set_failing(false);
    assert!(h.manager.evict(&id).await);
    assert_eq!(h.manager.cache().pending_flush_count(), 0);
    assert_eq!(restored_samples(&h, &id).await, seen);
}

#[tokio::test]
async fn test_unsaved_eviction_blob_is_saved_on_warm_start() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;
    for i in 0..20 {
        h.manager.score(&id, vector(i)).await.unwrap();
    }
    let seen = resident_samples(&h, &id);

    h.store.set_failing(true);
    assert!(h.manager.evict(&id).await);
    h.store.set_failing(false);

    let _ = h.manager.score(&id, vector(100)).await;
    wait_until(|| h.metrics.cold_start_count("warm_started") == 1).await;
    assert_eq!(resident_samples(&h, &id), seen);
    assert_eq!(restored_samples(&h, &id).await, seen);
    assert_eq!(h.manager.cache().pending_flush_count(), 0);
}

#[tokio::test]
async fn test_slow_periodic_save_does_not_overwrite_eviction_save() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    h.store.delay_next_put(Duration::from_millis(300));
    let cache = Arc::clone(h.manager.cache());
    let periodic = tokio::spawn(async move { cache.checkpoint_active(Duration::ZERO).await });
    let store = Arc::clone(&h.store);
    wait_until(|| !store.delay_armed()).await;

    for i in 0..10 {
        h.manager.score(&id, vector(i)).await.unwrap();
    }
    let seen = resident_samples(&h, &id);
    assert!(h.manager.evict(&id).await);
    assert_eq!(periodic.await.unwrap(), 1);

    assert_eq!(restored_samples(&h, &id).await, seen);
}

struct GatedFactory {
    inner: DefaultModelFactory,
    gate: std::sync::Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl ModelFactory for GatedFactory {
    fn min_training_samples(&self) -> usize {
        self.inner.min_training_samples()
    }

    fn estimated_size(&self, config: &DetectorConfig) -> usize {
        self.inner.estimated_size(config)
    }

    fn train(&self, config: &DetectorConfig, samples: &[Vec<f64>]) -> Result<ModelPair, ModelError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.train(config, samples)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<ModelPair, ModelError> {
        self.inner.deserialize(bytes)
    }
}

#[tokio::test]
async fn test_losing_training_race_keeps_checkpoint() {
    let h = Harness::new("node-a");
    let id = h.add_detector("d1").await;
    h.seed_history(&id, 32);

    let (release, gate) = std::sync::mpsc::channel();
    let factory = Arc::new(GatedFactory {
        inner: DefaultModelFactory::new(factory_config()),
        gate: std::sync::Mutex::new(Some(gate)),
    });
    let slow = Arc::new(ModelTrainer::new(
        Arc::clone(h.manager.cache()),
        h.checkpoints().clone(),
        h.features.clone(),
        Arc::clone(h.manager.state()),
        factory.clone(),
        h.metrics.clone(),
        StructuredLogger::new("node-a"),
    ));
    let slow_id = id.clone();
    let slow_job = {
        let slow = Arc::clone(&slow);
        tokio::spawn(async move { slow.run(&slow_id).await })
    };
    wait_until(|| factory.gate.lock().unwrap().is_none()).await;

    // Meanwhile the regular cold start installs and serves a model
    let _ = h.manager.score(&id, vector(0)).await;
    h.wait_resident(&id).await;
    let manager = Arc::clone(&h.manager);
    wait_until(|| !manager.runner().is_pending(&id)).await;
    for i in 1..10 {
        h.manager.score(&id, vector(i)).await.unwrap();
    }
    assert_eq!(h.manager.flush_all().await, (1, 0));
    let saved = restored_samples(&h, &id).await;
    let puts = h.store.puts.load(Ordering::SeqCst);

    release.send(()).unwrap();
    let outcome = slow_job.await.unwrap().unwrap();
    assert_eq!(outcome, ColdStartOutcome::AlreadyResident);
    assert_eq!(h.store.puts.load(Ordering::SeqCst), puts);
    assert_eq!(restored_samples(&h, &id).await, saved);
    assert_eq!(resident_samples(&h, &id), saved);
}

#[tokio::test]
async fn test_stop_detector_drops_model_and_checkpoint() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    assert!(h.manager.stop_detector(&id).await.unwrap());
    assert!(!h.manager.cache().contains(&id));
    assert_eq!(h.manager.cache().used_bytes(), 0);
    assert!(h.store.inner.get(&id).await.unwrap().is_none());
    assert!(!h.manager.stop_detector(&id).await.unwrap());
}

#[tokio::test]
async fn test_deleted_detector_is_cleaned_up() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    h.manager
        .on_detector_event(DetectorEvent::Deleted(id.clone()))
        .await
        .unwrap();
    assert!(!h.manager.cache().contains(&id));
    assert!(h.store.inner.get(&id).await.unwrap().is_none());
    assert_eq!(h.features.window_len(&id), 0);
    assert!(h.tombstones.contains(&id));

    assert_eq!(h.manager.reconcile_deleted(false).await.unwrap(), 1);
    assert!(h.tombstones.is_empty());
}

#[tokio::test]
async fn test_deletion_during_outage_is_reconciled() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    h.store.set_failing(true);
    h.manager
        .on_detector_event(DetectorEvent::Deleted(id.clone()))
        .await
        .unwrap();
    assert!(h.store.inner.get(&id).await.unwrap().is_some());

    h.store.set_failing(false);
    assert_eq!(h.manager.reconcile_deleted(true).await.unwrap(), 1);
    assert!(h.store.inner.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_shape_change_retrains() {
    let h = Harness::new("node-a");
    let id = h.ready("d1").await;

    // Three features with the same shingle: six dimensions
    h.detectors.put(detector_config("d1", 3, 2)).await.unwrap();
    h.manager
        .on_detector_event(DetectorEvent::Updated(id.clone()))
        .await
        .unwrap();
    h.features
        .extend(&id, (0..32).map(|i| vec![i as f64 * 0.1; 6]));

    let six = FeatureVector::new(vec![0.5; 6]);
    let result = h.manager.score(&id, six.clone()).await;
    assert!(matches!(result, Err(LifecycleError::NotReady(_))));

    wait_until(|| h.metrics.cold_start_count("trained") == 2).await;
    assert!(h.manager.score(&id, six).await.is_ok());
}

#[tokio::test]
async fn test_maintenance_evicts_idle_models() {
    let config = CacheConfig {
        model_idle_ttl: Duration::from_millis(50),
        ..cache_for(4)
    };
    let h = Harness::builder("node-a").cache(config).build();
    let id = h.ready("d1").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.manager.maintenance().await;
    assert_eq!(report.idle_evicted, 1);
    assert!(!h.manager.cache().contains(&id));
    assert_eq!(h.metrics.eviction_count("idle"), 1);
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_maintenance_checkpoints_active_models() {
    let config = CacheConfig {
        checkpoint_interval: Duration::from_millis(50),
        ..cache_for(4)
    };
    let h = Harness::builder("node-a").cache(config).build();
    let id = h.ready("d1").await;
    h.manager.score(&id, vector(7)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.manager.maintenance().await;
    assert_eq!(report.checkpointed, 1);
    assert!(h.manager.cache().contains(&id));
    assert_eq!(restored_samples(&h, &id).await, resident_samples(&h, &id));
}

#[tokio::test]
async fn test_watermark_eviction_drains_to_low_mark() {
    let config = CacheConfig {
        high_watermark: 0.7,
        low_watermark: 0.4,
        ..cache_for(4)
    };
    let h = Harness::builder("node-a").cache(config).build();
    let d1 = h.ready("d1").await;
    let d2 = h.ready("d2").await;
    let d3 = h.ready("d3").await;

    assert_eq!(h.manager.cache().evict_to_watermark().await, 2);
    assert!(!h.manager.cache().contains(&d1));
    assert!(!h.manager.cache().contains(&d2));
    assert!(h.manager.cache().contains(&d3));
    assert_eq!(h.manager.cache().evict_to_watermark().await, 0);
}

#[tokio::test]
async fn test_flush_all_keeps_models_resident() {
    let h = Harness::new("node-a");
    let d1 = h.ready("d1").await;
    h.ready("d2").await;

    assert_eq!(h.manager.flush_all().await, (2, 0));
    assert!(h.manager.cache().contains(&d1));
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_shutdown_checkpoints_everything() {
    let h = Harness::new("node-a");
    let d1 = h.ready("d1").await;
    h.ready("d2").await;

    assert_eq!(h.manager.shutdown().await, 2);
    assert!(h.manager.cache().is_empty());
    assert_eq!(h.metrics.eviction_count("shutdown"), 2);
    assert_eq!(h.manager.runner().submit(&d1), SubmitOutcome::Rejected);
}
