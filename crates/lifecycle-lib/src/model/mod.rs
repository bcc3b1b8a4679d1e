//! Model pair abstraction
//!
//! The lifecycle code only sees two capabilities:
//! - a forest model turning a feature vector into a raw anomaly score
//! - a threshold model turning the raw score into a calibrated grade
//!
//! Both update online and serialize to opaque bytes. A `ModelFactory` trains
//! fresh pairs and restores them from checkpoints, so the scoring primitive can
//! be swapped without touching lifecycle code.

mod factory;
mod forest;
mod stats;
mod threshold;

pub use factory::{DefaultModelFactory, ModelFactoryConfig};
pub use forest::StreamingStatsForest;
pub use stats::DecayingStats;
pub use threshold::ScoreThreshold;

use crate::models::DetectorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by model implementations
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("failed to encode model: {0}")]
    Encode(String),
    #[error("failed to decode model: {0}")]
    Decode(String),
    #[error("insufficient training data: {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Stateful online scoring primitive
pub trait ForestModel: Send + Sync {
    /// Raw score of `point` without changing the model
    fn score(&self, point: &[f64]) -> f64;

    /// Score `point`, then fold it into the model
    fn update(&mut self, point: &[f64]) -> f64;

    fn dimensions(&self) -> usize;

    fn samples_seen(&self) -> u64;

    /// Approximate heap footprint
    fn size_bytes(&self) -> usize;

    fn serialize(&self) -> Result<Vec<u8>, ModelError>;
}

/// Stateful calibrator turning raw scores into grades
pub trait ThresholdModel: Send + Sync {
    /// Grade of `raw_score` without changing the model
    fn grade(&self, raw_score: f64) -> f64;

    /// Grade `raw_score`, then fold it into the model
    fn update(&mut self, raw_score: f64) -> f64;

    /// Confidence in emitted grades, in [0, 1]
    fn confidence(&self) -> f64;

    fn samples_seen(&self) -> u64;

    fn size_bytes(&self) -> usize;

    fn serialize(&self) -> Result<Vec<u8>, ModelError>;
}

/// Output of feeding one vector through a pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    pub score: f64,
    pub grade: f64,
    pub confidence: f64,
}

/// Live forest + threshold models for one detector
pub struct ModelPair {
    pub forest: Box<dyn ForestModel>,
    pub threshold: Box<dyn ThresholdModel>,
}

/// On-the-wire layout of a serialized pair
#[derive(Serialize, Deserialize)]
pub(crate) struct PairBlob {
    pub forest: Vec<u8>,
    pub threshold: Vec<u8>,
}

impl ModelPair {
    pub fn new(forest: Box<dyn ForestModel>, threshold: Box<dyn ThresholdModel>) -> Self {
        Self { forest, threshold }
    }

    /// Score a vector and update both models
    pub fn update(&mut self, point: &[f64]) -> Result<PairScore, ModelError> {
        let expected = self.forest.dimensions();
        if point.len() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: point.len(),
            });
        }

        let score = self.forest.update(point);
        let grade = self.threshold.update(score);
        Ok(PairScore {
            score,
            grade,
            confidence: self.threshold.confidence(),
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.forest.size_bytes() + self.threshold.size_bytes()
    }

    pub fn samples_seen(&self) -> u64 {
        self.forest.samples_seen()
    }

    /// Serialize both models into one blob
    pub fn serialize(&self) -> Result<Vec<u8>, ModelError> {
        let blob = PairBlob {
            forest: self.forest.serialize()?,
            threshold: self.threshold.serialize()?,
        };
        serde_json::to_vec(&blob).map_err(|e| ModelError::Encode(e.to_string()))
    }
}

impl std::fmt::Debug for ModelPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPair")
            .field("dimensions", &self.forest.dimensions())
            .field("samples_seen", &self.samples_seen())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Trains and restores model pairs
pub trait ModelFactory: Send + Sync {
    /// Minimum number of historical vectors needed to train
    fn min_training_samples(&self) -> usize;

    /// Size estimate of a pair for `config`, used to reserve cache room before training
    fn estimated_size(&self, config: &DetectorConfig) -> usize;

    /// Train a fresh pair on historical vectors
    fn train(&self, config: &DetectorConfig, samples: &[Vec<f64>]) -> Result<ModelPair, ModelError>;

    /// Restore a pair from `ModelPair::serialize` output
    fn deserialize(&self, bytes: &[u8]) -> Result<ModelPair, ModelError>;
}
