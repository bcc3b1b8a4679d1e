//! Factory for the reference model pair

use super::forest::StreamingStatsForest;
use super::threshold::ScoreThreshold;
use super::{ModelError, ModelFactory, ModelPair, PairBlob};
use crate::models::DetectorConfig;

/// Tuning for the reference models
#[derive(Debug, Clone)]
pub struct ModelFactoryConfig {
    /// Decay of the per-coordinate statistics
    pub forest_decay: f64,
    /// Decay of the raw-score statistics
    pub threshold_decay: f64,
    /// Standard scores above this start producing a grade
    pub threshold_z: f64,
    /// Samples the threshold model needs before grading
    pub threshold_min_samples: u64,
    /// Historical vectors required for a cold start
    pub min_training_samples: usize,
}

impl Default for ModelFactoryConfig {
    fn default() -> Self {
        Self {
            forest_decay: 0.0001,
            threshold_decay: 0.0001,
            threshold_z: 3.0,
            threshold_min_samples: 32,
            min_training_samples: 128,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultModelFactory {
    config: ModelFactoryConfig,
}

impl DefaultModelFactory {
    pub fn new(config: ModelFactoryConfig) -> Self {
        Self { config }
    }

    fn fresh_pair(&self, dimensions: usize) -> ModelPair {
        ModelPair::new(
            Box::new(StreamingStatsForest::new(dimensions, self.config.forest_decay)),
            Box::new(ScoreThreshold::new(
                self.config.threshold_decay,
                self.config.threshold_z,
                self.config.threshold_min_samples,
            )),
        )
    }
}

impl ModelFactory for DefaultModelFactory {
    fn min_training_samples(&self) -> usize {
        self.config.min_training_samples
    }

    fn estimated_size(&self, config: &DetectorConfig) -> usize {
        self.fresh_pair(config.dimensions()).size_bytes()
    }

    fn train(&self, config: &DetectorConfig, samples: &[Vec<f64>]) -> Result<ModelPair, ModelError> {
        let need = self.config.min_training_samples;
        if samples.len() < need {
            return Err(ModelError::InsufficientData {
                have: samples.len(),
                need,
            });
        }

        let mut pair = self.fresh_pair(config.dimensions());
        for sample in samples {
            pair.update(sample)?;
        }
        Ok(pair)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<ModelPair, ModelError> {
        let blob: PairBlob =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))?;
        let forest = StreamingStatsForest::from_bytes(&blob.forest)?;
        let threshold = ScoreThreshold::from_bytes(&blob.threshold)?;
        Ok(ModelPair::new(Box::new(forest), Box::new(threshold)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::detector_config;

    fn samples(count: usize, dims: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| (0..dims).map(|d| (d as f64) + (i % 7) as f64 * 0.1).collect())
            .collect()
    }

    #[test]
    fn test_train_rejects_short_history() {
        let factory = DefaultModelFactory::default();
        let config = detector_config("d1", 1, 4);
        let result = factory.train(&config, &samples(10, 4));
        assert!(matches!(
            result,
            Err(ModelError::InsufficientData { have: 10, need: 128 })
        ));
    }

    #[test]
    fn test_train_rejects_wrong_dimensions() {
        let factory = DefaultModelFactory::default();
        let config = detector_config("d1", 1, 4);
        let result = factory.train(&config, &samples(200, 3));
        assert!(matches!(result, Err(ModelError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_serialized_pair_keeps_scoring_state() {
        let factory = DefaultModelFactory::default();
        let config = detector_config("d1", 2, 2);
        let mut original = factory.train(&config, &samples(300, 4)).unwrap();

        let bytes = original.serialize().unwrap();
        let mut restored = factory.deserialize(&bytes).unwrap();

        let point = vec![3.0, 0.5, 9.0, 1.0];
        let a = original.update(&point).unwrap();
        let b = restored.update(&point).unwrap();
        assert_eq!(a, b);
        assert_eq!(original.samples_seen(), restored.samples_seen());
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let factory = DefaultModelFactory::default();
        assert!(factory.deserialize(b"{\"forest\":[1,2],\"threshold\":[]}").is_err());
    }
}
