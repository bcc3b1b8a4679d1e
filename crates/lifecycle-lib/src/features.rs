//! Feature pipeline boundary
//!
//! Feature retrieval and shingling live outside the lifecycle manager. Cold
//! starts only need a window of historical vectors per detector, which is
//! what `FeatureSource` provides.

use crate::error::{LifecycleError, Result};
use crate::models::{DetectorConfig, DetectorId, FeatureVector};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Supplier of historical training windows
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Shingled historical vectors for a cold start, oldest first
    async fn training_samples(&self, config: &DetectorConfig) -> Result<Vec<Vec<f64>>>;

    /// Called with vectors that arrive while no model is resident
    fn observe(&self, _detector_id: &DetectorId, _vector: &FeatureVector) {}

    /// Drop anything held for a deleted detector
    fn forget(&self, _detector_id: &DetectorId) {}
}

/// Check a vector against the detector's shape
pub fn validate(config: &DetectorConfig, vector: &FeatureVector) -> Result<()> {
    let expected = config.dimensions();
    if vector.len() != expected {
        return Err(LifecycleError::InvalidFeatures(format!(
            "detector {} expects {} values, got {}",
            config.detector_id,
            expected,
            vector.len()
        )));
    }
    if !vector.is_finite() {
        return Err(LifecycleError::InvalidFeatures(
            "feature values must be finite".to_string(),
        ));
    }
    Ok(())
}

/// Feature source that trains from vectors observed by this node
///
/// Keeps the most recent `capacity` vectors per detector. Used when no
/// external history is wired in: early scoring requests answer `NotReady`
/// and double as the training window.
#[derive(Debug)]
pub struct ObservedFeatureSource {
    windows: DashMap<DetectorId, VecDeque<Vec<f64>>>,
    capacity: usize,
}

impl ObservedFeatureSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Seed a detector's window, e.g. from a backfill
    pub fn extend(&self, detector_id: &DetectorId, samples: impl IntoIterator<Item = Vec<f64>>) {
        let mut window = self.windows.entry(detector_id.clone()).or_default();
        for sample in samples {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(sample);
        }
    }

    pub fn window_len(&self, detector_id: &DetectorId) -> usize {
        self.windows.get(detector_id).map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FeatureSource for ObservedFeatureSource {
    async fn training_samples(&self, config: &DetectorConfig) -> Result<Vec<Vec<f64>>> {
        let dims = config.dimensions();
        Ok(self
            .windows
            .get(&config.detector_id)
            .map(|w| w.iter().filter(|s| s.len() == dims).cloned().collect())
            .unwrap_or_default())
    }

    fn observe(&self, detector_id: &DetectorId, vector: &FeatureVector) {
        self.extend(detector_id, std::iter::once(vector.values().to_vec()));
    }

    fn forget(&self, detector_id: &DetectorId) {
        self.windows.remove(detector_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::detector_config;

    #[test]
    fn test_validate_dimensions() {
        let config = detector_config("d1", 2, 2);
        assert!(validate(&config, &FeatureVector::new(vec![1.0; 4])).is_ok());

        let err = validate(&config, &FeatureVector::new(vec![1.0; 3])).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidFeatures(_)));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let config = detector_config("d1", 1, 2);
        let err = validate(&config, &FeatureVector::new(vec![1.0, f64::NAN])).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidFeatures(_)));
    }

    #[tokio::test]
    async fn test_observed_window_is_bounded() {
        let source = ObservedFeatureSource::new(3);
        let config = detector_config("d1", 1, 1);
        for i in 0..5 {
            source.observe(&config.detector_id, &FeatureVector::new(vec![i as f64]));
        }

        let samples = source.training_samples(&config).await.unwrap();
        assert_eq!(samples, vec![vec![2.0], vec![3.0], vec![4.0]]);

        source.forget(&config.detector_id);
        assert_eq!(source.window_len(&config.detector_id), 0);
    }
}
