//! Cold-start job: warm start from a checkpoint or train from history

use super::cache::ModelCache;
use super::coldstart::{ColdStartOutcome, ColdStartTask};
use crate::checkpoint::CheckpointAdapter;
use crate::detector::DetectorStateManager;
use crate::error::{LifecycleError, Result};
use crate::features::FeatureSource;
use crate::model::{ModelError, ModelFactory, ModelPair};
use crate::models::{DetectorConfig, DetectorId};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct ModelTrainer {
    cache: Arc<ModelCache>,
    checkpoints: CheckpointAdapter,
    features: Arc<dyn FeatureSource>,
    state: Arc<DetectorStateManager>,
    factory: Arc<dyn ModelFactory>,
    metrics: LifecycleMetrics,
    logger: StructuredLogger,
}

fn training_failed(detector_id: &DetectorId, e: ModelError) -> LifecycleError {
    LifecycleError::TrainingFailed {
        detector_id: detector_id.clone(),
        reason: e.to_string(),
    }
}

impl ModelTrainer {
    pub fn new(
        cache: Arc<ModelCache>,
        checkpoints: CheckpointAdapter,
        features: Arc<dyn FeatureSource>,
        state: Arc<DetectorStateManager>,
        factory: Arc<dyn ModelFactory>,
        metrics: LifecycleMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cache,
            checkpoints,
            features,
            state,
            factory,
            metrics,
            logger,
        }
    }

    async fn cold_start(&self, detector_id: &DetectorId) -> Result<ColdStartOutcome> {
        if self.cache.contains(detector_id) {
            return Ok(ColdStartOutcome::AlreadyResident);
        }

        let config = self.state.get_detector_config(detector_id).await?;

        if let Some(outcome) = self.warm_start(&config).await? {
            return Ok(outcome);
        }
        self.train(&config).await
    }

    /// Install the newest saved state of the detector, if there is one
    ///
    /// A blob whose eviction save failed is newer than the stored
    /// checkpoint, so it is tried first and kept until a save succeeds.
    async fn warm_start(&self, config: &DetectorConfig) -> Result<Option<ColdStartOutcome>> {
        let detector_id = &config.detector_id;
        self.cache.settle_eviction(detector_id).await;

        if let Some(flush) = self.cache.pending_flush(detector_id) {
            match self.restorable(config, &flush.model) {
                Some(pair) => {
                    let reservation = self.cache.reserve(detector_id, pair.size_bytes()).await?;
                    if !self.cache.install(detector_id, pair, reservation) {
                        return Ok(Some(ColdStartOutcome::AlreadyResident));
                    }
                    if !self.cache.checkpoint(detector_id).await {
                        warn!(detector_id = %detector_id, "Restored unsaved model, checkpoint still pending");
                    }
                    debug!(detector_id = %detector_id, "Warm-started from unsaved eviction blob");
                    return Ok(Some(ColdStartOutcome::WarmStarted));
                }
                None => self.cache.drop_pending_flush(detector_id),
            }
        }

        let Some(checkpoint) = self.checkpoints.load(detector_id).await? else {
            return Ok(None);
        };
        let Some(pair) = self.restorable(config, &checkpoint.model) else {
            return Ok(None);
        };

        let reservation = self.cache.reserve(detector_id, pair.size_bytes()).await?;
        if !self.cache.install(detector_id, pair, reservation) {
            return Ok(Some(ColdStartOutcome::AlreadyResident));
        }
        self.state
            .record_checkpoint(detector_id, checkpoint.updated_at);
        debug!(detector_id = %detector_id, "Warm-started from checkpoint");
        Ok(Some(ColdStartOutcome::WarmStarted))
    }

    /// Decode a saved model, rejecting ones built for another shape
    fn restorable(&self, config: &DetectorConfig, model: &[u8]) -> Option<ModelPair> {
        let detector_id = &config.detector_id;
        let pair = match self.factory.deserialize(model) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(detector_id = %detector_id, error = %e, "Saved model not restorable, training instead");
                return None;
            }
        };
        if pair.forest.dimensions() != config.dimensions() {
            warn!(
                detector_id = %detector_id,
                saved_dimensions = pair.forest.dimensions(),
                detector_dimensions = config.dimensions(),
                "Saved model shape does not match detector, training instead"
            );
            return None;
        }
        Some(pair)
    }

    async fn train(&self, config: &DetectorConfig) -> Result<ColdStartOutcome> {
        let detector_id = &config.detector_id;
        let samples = self.features.training_samples(config).await?;
        let need = self.factory.min_training_samples();
        if samples.len() < need {
            return Err(training_failed(
                detector_id,
                ModelError::InsufficientData {
                    have: samples.len(),
                    need,
                },
            ));
        }

        let reservation = self
            .cache
            .reserve(detector_id, self.factory.estimated_size(config))
            .await?;

        let factory = Arc::clone(&self.factory);
        let train_config = config.clone();
        let pair: ModelPair = tokio::task::spawn_blocking(move || {
            factory.train(&train_config, &samples)
        })
        .await
        .map_err(|e| LifecycleError::TrainingFailed {
            detector_id: detector_id.clone(),
            reason: format!("training task failed: {}", e),
        })?
        .map_err(|e| training_failed(detector_id, e))?;

        if !self.cache.install(detector_id, pair, reservation) {
            return Ok(ColdStartOutcome::AlreadyResident);
        }
        // Saved under the entry lock, ordered with any eviction save
        if !self.cache.checkpoint(detector_id).await {
            warn!(detector_id = %detector_id, "Initial checkpoint save failed");
        }
        Ok(ColdStartOutcome::Trained)
    }
}

#[async_trait]
impl ColdStartTask for ModelTrainer {
    async fn run(&self, detector_id: &DetectorId) -> Result<ColdStartOutcome> {
        let started = Instant::now();
        match self.cold_start(detector_id).await {
            Ok(outcome) => {
                self.state.clear_error(detector_id);
                self.metrics.inc_cold_start(outcome.as_str());
                self.logger.log_cold_start_completed(
                    detector_id.as_str(),
                    outcome.as_str(),
                    started.elapsed(),
                );
                Ok(outcome)
            }
            Err(e) => {
                self.state.report_error(detector_id, e.to_string());
                self.metrics.inc_cold_start("failed");
                self.logger
                    .log_cold_start_failed(detector_id.as_str(), &e.to_string());
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ModelTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelTrainer").finish_non_exhaustive()
    }
}
