//! Memory-bounded map of resident model pairs
//!
//! Each detector has its own entry behind an async mutex, so scoring one
//! detector never waits on another. An entry that is being evicted keeps
//! its lock until the checkpoint save finishes; scorers queued on it then
//! observe the `evicted` flag and treat the lookup as a miss.

use crate::checkpoint::CheckpointAdapter;
use crate::detector::DetectorStateManager;
use crate::error::{LifecycleError, Result};
use crate::model::{ModelError, ModelPair, PairScore};
use crate::models::{DetectorId, ModelSummary};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory available to the process
    pub memory_limit_bytes: u64,
    /// Share of `memory_limit_bytes` resident models may use
    pub model_max_size_percentage: f64,
    /// Background eviction starts above this share of the budget
    pub high_watermark: f64,
    /// Background eviction stops at this share of the budget
    pub low_watermark: f64,
    /// Models unused for this long are evicted by maintenance
    pub model_idle_ttl: Duration,
    /// Active models are checkpointed at least this often
    pub checkpoint_interval: Duration,
    /// How often the watermark evictor checks usage
    pub evictor_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 1024 * 1024 * 1024,
            model_max_size_percentage: 0.1,
            high_watermark: 0.95,
            low_watermark: 0.8,
            model_idle_ttl: Duration::from_secs(3600),
            checkpoint_interval: Duration::from_secs(3600),
            evictor_interval: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    pub fn budget_bytes(&self) -> usize {
        (self.memory_limit_bytes as f64 * self.model_max_size_percentage) as usize
    }
}

/// Why a model left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    MemoryPressure,
    Idle,
    Handoff,
    Shutdown,
    Requested,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::MemoryPressure => "memory_pressure",
            EvictionReason::Idle => "idle",
            EvictionReason::Handoff => "handoff",
            EvictionReason::Shutdown => "shutdown",
            EvictionReason::Requested => "requested",
        }
    }
}

struct CacheEntry {
    pair: Mutex<Option<ModelPair>>,
    evicted: AtomicBool,
    size_bytes: AtomicUsize,
    samples_seen: AtomicU64,
    /// Logical LRU clock value of the last use
    last_touch: AtomicU64,
    /// Millis since the cache epoch
    last_used: AtomicU64,
    last_used_wall: AtomicI64,
    checkpointed_at: AtomicU64,
}

/// Result of scoring against the cache
#[derive(Debug)]
pub(crate) enum CacheLookup {
    Scored(PairScore),
    Miss,
    /// Resident pair was built for a different detector shape
    Stale,
}

/// Room held for a model that is about to be installed
///
/// Released on drop if the model is never installed.
#[must_use]
pub(crate) struct Reservation<'a> {
    cache: &'a ModelCache,
    bytes: usize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.cache
            .reserved_bytes
            .fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Serialized model whose checkpoint save failed
#[derive(Debug, Clone)]
pub(crate) struct PendingFlush {
    pub model: Vec<u8>,
    pub updated_at: i64,
}

pub struct ModelCache {
    entries: DashMap<DetectorId, Arc<CacheEntry>>,
    pending_flushes: DashMap<DetectorId, PendingFlush>,
    used_bytes: AtomicUsize,
    reserved_bytes: AtomicUsize,
    clock: AtomicU64,
    epoch: Instant,
    /// Serializes LRU sweeps so concurrent reservations do not over-evict
    eviction_lock: Mutex<()>,
    budget: usize,
    config: CacheConfig,
    checkpoints: CheckpointAdapter,
    state: Arc<DetectorStateManager>,
    metrics: LifecycleMetrics,
    logger: StructuredLogger,
}

impl ModelCache {
    pub fn new(
        config: CacheConfig,
        checkpoints: CheckpointAdapter,
        state: Arc<DetectorStateManager>,
        metrics: LifecycleMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let budget = config.budget_bytes();
        metrics.set_cache_budget(budget);
        Self {
            entries: DashMap::new(),
            pending_flushes: DashMap::new(),
            used_bytes: AtomicUsize::new(0),
            reserved_bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            eviction_lock: Mutex::new(()),
            budget,
            config,
            checkpoints,
            state,
            metrics,
            logger,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live pair is resident for the detector
    pub fn contains(&self, detector_id: &DetectorId) -> bool {
        self.entries
            .get(detector_id)
            .map(|e| !e.evicted.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn resident_ids(&self) -> Vec<DetectorId> {
        self.entries
            .iter()
            .filter(|e| !e.evicted.load(Ordering::SeqCst))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        let mut summaries: Vec<ModelSummary> = self
            .entries
            .iter()
            .filter(|e| !e.evicted.load(Ordering::SeqCst))
            .map(|e| ModelSummary {
                detector_id: e.key().clone(),
                size_bytes: e.size_bytes.load(Ordering::SeqCst),
                samples_seen: e.samples_seen.load(Ordering::SeqCst),
                last_used: e.last_used_wall.load(Ordering::SeqCst),
            })
            .collect();
        summaries.sort_by(|a, b| a.detector_id.cmp(&b.detector_id));
        summaries
    }

    pub fn pending_flush_count(&self) -> usize {
        self.pending_flushes.len()
    }

    pub fn has_pending_flush(&self, detector_id: &DetectorId) -> bool {
        self.pending_flushes.contains_key(detector_id)
    }

    /// Unsaved blob left by a failed eviction save; newer than any checkpoint
    pub(crate) fn pending_flush(&self, detector_id: &DetectorId) -> Option<PendingFlush> {
        self.pending_flushes.get(detector_id).map(|f| f.clone())
    }

    pub(crate) fn drop_pending_flush(&self, detector_id: &DetectorId) {
        if self.pending_flushes.remove(detector_id).is_some() {
            self.update_metrics();
        }
    }

    /// Wait for an eviction of the detector that is still saving
    pub(crate) async fn settle_eviction(&self, detector_id: &DetectorId) {
        let entry = self
            .entries
            .get(detector_id)
            .filter(|e| e.evicted.load(Ordering::SeqCst))
            .map(|e| Arc::clone(e.value()));
        if let Some(entry) = entry {
            drop(entry.pair.lock().await);
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self, entry: &CacheEntry) {
        entry
            .last_touch
            .store(self.clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        entry.last_used.store(self.now_millis(), Ordering::SeqCst);
        entry
            .last_used_wall
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn update_metrics(&self) {
        self.metrics.set_cache_usage(self.len(), self.used_bytes());
        self.metrics.set_pending_flushes(self.pending_flush_count());
    }

    /// Score a point against the resident pair, updating it online
    pub(crate) async fn score(
        &self,
        detector_id: &DetectorId,
        point: &[f64],
        dimensions: usize,
    ) -> std::result::Result<CacheLookup, ModelError> {
        let Some(entry) = self.entries.get(detector_id).map(|e| Arc::clone(e.value())) else {
            return Ok(CacheLookup::Miss);
        };

        let mut guard = entry.pair.lock().await;
        let Some(pair) = guard.as_mut() else {
            return Ok(CacheLookup::Miss);
        };
        if pair.forest.dimensions() != dimensions {
            return Ok(CacheLookup::Stale);
        }

        let score = pair.update(point)?;
        entry
            .samples_seen
            .store(pair.samples_seen(), Ordering::SeqCst);

        let new_size = pair.size_bytes();
        let old_size = entry.size_bytes.swap(new_size, Ordering::SeqCst);
        if new_size >= old_size {
            self.used_bytes
                .fetch_add(new_size - old_size, Ordering::SeqCst);
        } else {
            self.used_bytes
                .fetch_sub(old_size - new_size, Ordering::SeqCst);
        }
        drop(guard);

        self.touch(&entry);
        Ok(CacheLookup::Scored(score))
    }

    /// Hold room for a model of `bytes`, evicting LRU pairs if needed
    pub(crate) async fn reserve(
        &self,
        detector_id: &DetectorId,
        bytes: usize,
    ) -> Result<Reservation<'_>> {
        if bytes > self.budget {
            return Err(LifecycleError::TrainingFailed {
                detector_id: detector_id.clone(),
                reason: format!(
                    "model of {} bytes exceeds the {} byte memory budget",
                    bytes, self.budget
                ),
            });
        }

        let _sweep = self.eviction_lock.lock().await;
        loop {
            let committed =
                self.used_bytes.load(Ordering::SeqCst) + self.reserved_bytes.load(Ordering::SeqCst);
            if committed + bytes <= self.budget {
                self.reserved_bytes.fetch_add(bytes, Ordering::SeqCst);
                return Ok(Reservation { cache: self, bytes });
            }

            match self.lru_victim(Some(detector_id)) {
                Some(victim) => {
                    debug!(detector_id = %detector_id, victim = %victim, "Evicting to make room");
                    self.evict(&victim, EvictionReason::MemoryPressure).await;
                }
                None => {
                    return Err(LifecycleError::TrainingFailed {
                        detector_id: detector_id.clone(),
                        reason: "memory budget exhausted by models in training".to_string(),
                    });
                }
            }
        }
    }

    /// Install a pair; returns false if a live pair is already resident
    pub(crate) fn install(
        &self,
        detector_id: &DetectorId,
        pair: ModelPair,
        reservation: Reservation<'_>,
    ) -> bool {
        let size = pair.size_bytes();
        let now = self.now_millis();
        let entry = Arc::new(CacheEntry {
            samples_seen: AtomicU64::new(pair.samples_seen()),
            pair: Mutex::new(Some(pair)),
            evicted: AtomicBool::new(false),
            size_bytes: AtomicUsize::new(size),
            last_touch: AtomicU64::new(self.clock.fetch_add(1, Ordering::SeqCst)),
            last_used: AtomicU64::new(now),
            last_used_wall: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            checkpointed_at: AtomicU64::new(now),
        });

        let installed = match self.entries.entry(detector_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().evicted.load(Ordering::SeqCst) {
                    occupied.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        };

        if installed {
            self.used_bytes.fetch_add(size, Ordering::SeqCst);
        }
        drop(reservation);
        self.update_metrics();
        installed
    }

    fn lru_victim(&self, exclude: Option<&DetectorId>) -> Option<DetectorId> {
        self.entries
            .iter()
            .filter(|e| !e.evicted.load(Ordering::SeqCst))
            .filter(|e| Some(e.key()) != exclude)
            .min_by_key(|e| e.last_touch.load(Ordering::SeqCst))
            .map(|e| e.key().clone())
    }

    /// Serialize and save a pair; failed saves go to the pending-flush set
    async fn persist(&self, detector_id: &DetectorId, pair: &ModelPair) -> bool {
        let model = match pair.serialize() {
            Ok(model) => model,
            Err(e) => {
                error!(detector_id = %detector_id, error = %e, "Failed to serialize model");
                self.metrics.inc_checkpoint_failures();
                return false;
            }
        };

        let updated_at = chrono::Utc::now().timestamp_millis();
        match self.checkpoints.save(detector_id, &model, updated_at).await {
            Ok(()) => {
                self.state.record_checkpoint(detector_id, updated_at);
                self.pending_flushes.remove(detector_id);
                true
            }
            Err(e) => {
                self.metrics.inc_checkpoint_failures();
                self.logger
                    .log_flush_pending(detector_id.as_str(), &e.to_string());
                self.pending_flushes
                    .insert(detector_id.clone(), PendingFlush { model, updated_at });
                false
            }
        }
    }

    /// Evict a pair, awaiting its checkpoint save before releasing the slot
    pub async fn evict(&self, detector_id: &DetectorId, reason: EvictionReason) -> bool {
        let Some(entry) = self.entries.get(detector_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let mut guard = entry.pair.lock().await;
        let Some(pair) = guard.take() else {
            return false;
        };
        entry.evicted.store(true, Ordering::SeqCst);

        let size = entry.size_bytes.load(Ordering::SeqCst);
        let checkpointed = self.persist(detector_id, &pair).await;

        self.entries
            .remove_if(detector_id, |_, current| Arc::ptr_eq(current, &entry));
        self.used_bytes.fetch_sub(size, Ordering::SeqCst);
        drop(guard);

        self.metrics.inc_eviction(reason.as_str());
        self.logger
            .log_model_evicted(detector_id.as_str(), reason.as_str(), size, checkpointed);
        self.update_metrics();
        true
    }

    /// Drop a pair without saving it
    pub async fn discard(&self, detector_id: &DetectorId) -> bool {
        self.pending_flushes.remove(detector_id);
        let Some(entry) = self.entries.get(detector_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let mut guard = entry.pair.lock().await;
        let discarded = guard.take().is_some();
        if discarded {
            entry.evicted.store(true, Ordering::SeqCst);
            self.entries
                .remove_if(detector_id, |_, current| Arc::ptr_eq(current, &entry));
            self.used_bytes
                .fetch_sub(entry.size_bytes.load(Ordering::SeqCst), Ordering::SeqCst);
            debug!(detector_id = %detector_id, "Discarded model without checkpoint");
        }
        drop(guard);

        self.update_metrics();
        discarded
    }

    /// Evict LRU pairs while usage is above the high watermark, down to the low one
    pub async fn evict_to_watermark(&self) -> usize {
        let high = (self.budget as f64 * self.config.high_watermark) as usize;
        let low = (self.budget as f64 * self.config.low_watermark) as usize;
        if self.used_bytes() <= high {
            return 0;
        }

        let _sweep = self.eviction_lock.lock().await;
        let mut evicted = 0;
        while self.used_bytes() > low {
            let Some(victim) = self.lru_victim(None) else {
                break;
            };
            if self.evict(&victim, EvictionReason::MemoryPressure).await {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(
                evicted,
                used_bytes = self.used_bytes(),
                budget_bytes = self.budget,
                "Watermark eviction finished"
            );
        }
        evicted
    }

    /// Evict pairs unused for at least `ttl`
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.now_millis();
        let ttl_ms = ttl.as_millis() as u64;
        let idle: Vec<DetectorId> = self
            .entries
            .iter()
            .filter(|e| now.saturating_sub(e.last_used.load(Ordering::SeqCst)) >= ttl_ms)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for detector_id in idle {
            if self.evict(&detector_id, EvictionReason::Idle).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Save checkpoints of resident pairs not saved within `interval`
    pub async fn checkpoint_active(&self, interval: Duration) -> usize {
        let now = self.now_millis();
        let interval_ms = interval.as_millis() as u64;
        let due: Vec<(DetectorId, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|e| now.saturating_sub(e.checkpointed_at.load(Ordering::SeqCst)) >= interval_ms)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut saved = 0;
        for (detector_id, entry) in due {
            if self.save_resident(&detector_id, &entry).await {
                saved += 1;
            }
        }
        saved
    }

    /// Save the resident pair of a detector now
    pub(crate) async fn checkpoint(&self, detector_id: &DetectorId) -> bool {
        let Some(entry) = self.entries.get(detector_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        self.save_resident(detector_id, &entry).await
    }

    /// Serialize and save with the entry locked
    ///
    /// The lock is held across the save so an eviction of the same pair,
    /// whose save is newer, cannot land first.
    async fn save_resident(&self, detector_id: &DetectorId, entry: &CacheEntry) -> bool {
        let guard = entry.pair.lock().await;
        let model = match guard.as_ref().map(|pair| pair.serialize()) {
            Some(Ok(model)) => model,
            Some(Err(e)) => {
                error!(detector_id = %detector_id, error = %e, "Failed to serialize model");
                return false;
            }
            None => return false,
        };

        let updated_at = chrono::Utc::now().timestamp_millis();
        match self.checkpoints.save(detector_id, &model, updated_at).await {
            Ok(()) => {
                entry
                    .checkpointed_at
                    .store(self.now_millis(), Ordering::SeqCst);
                self.state.record_checkpoint(detector_id, updated_at);
                self.drop_pending_flush(detector_id);
                true
            }
            Err(e) => {
                self.metrics.inc_checkpoint_failures();
                warn!(detector_id = %detector_id, error = %e, "Checkpoint save failed");
                false
            }
        }
    }

    /// Save every resident pair, keeping it resident
    ///
    /// Returns `(saved, failed)`.
    pub async fn flush_all(&self) -> (usize, usize) {
        let resident: Vec<(DetectorId, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let (mut saved, mut failed) = (0, 0);
        for (detector_id, entry) in resident {
            if entry.evicted.load(Ordering::SeqCst) {
                continue;
            }
            if self.save_resident(&detector_id, &entry).await {
                saved += 1;
            } else {
                failed += 1;
            }
        }
        (saved, failed)
    }

    /// Evict every resident pair
    pub async fn evict_all(&self, reason: EvictionReason) -> usize {
        let mut evicted = 0;
        for detector_id in self.resident_ids() {
            if self.evict(&detector_id, reason).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Retry saving blobs whose eviction-time save failed
    ///
    /// Blobs of detectors that are resident again are dropped; the
    /// resident pair is newer.
    pub async fn retry_pending_flushes(&self) -> usize {
        let pending: Vec<(DetectorId, PendingFlush)> = self
            .pending_flushes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut flushed = 0;
        for (detector_id, flush) in pending {
            if self.contains(&detector_id) {
                self.pending_flushes.remove(&detector_id);
                continue;
            }
            match self
                .checkpoints
                .save(&detector_id, &flush.model, flush.updated_at)
                .await
            {
                Ok(()) => {
                    self.pending_flushes.remove(&detector_id);
                    self.state.record_checkpoint(&detector_id, flush.updated_at);
                    flushed += 1;
                }
                Err(e) => {
                    self.metrics.inc_checkpoint_failures();
                    warn!(detector_id = %detector_id, error = %e, "Pending checkpoint retry failed");
                }
            }
        }

        self.update_metrics();
        flushed
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("resident", &self.entries.len())
            .field("used_bytes", &self.used_bytes())
            .field("budget_bytes", &self.budget)
            .finish()
    }
}
