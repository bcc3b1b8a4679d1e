//! Core data models for the lifecycle manager

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Unique identifier of a detector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(String);

impl DetectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DetectorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A single feature monitored by a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub name: String,
    /// Aggregation applied to the raw field (e.g. "avg", "sum", "max")
    pub aggregation: String,
    pub field: String,
}

/// Detector configuration as read from the detector-definition store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub detector_id: DetectorId,
    /// Monitored entity reference (index, metric source, ...)
    pub entity: String,
    #[serde(with = "duration_secs")]
    pub detection_interval: Duration,
    #[serde(with = "duration_secs", default)]
    pub window_delay: Duration,
    pub features: Vec<FeatureDefinition>,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
}

fn default_shingle_size() -> usize {
    8
}

impl DetectorConfig {
    /// Dimensionality of the shingled feature vectors scored by this detector
    pub fn dimensions(&self) -> usize {
        self.features.len() * self.shingle_size
    }
}

/// Shingled feature vector produced by the feature pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every value is finite
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Result of scoring one feature vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub detector_id: DetectorId,
    /// Raw anomaly score from the forest model
    pub score: f64,
    /// Calibrated grade in [0, 1] from the threshold model
    pub grade: f64,
    /// Confidence in the grade, grows with the samples the threshold model has seen
    pub confidence: f64,
    pub scored_at: i64,
}

/// Versioned view of cluster membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub version: u64,
    pub nodes: BTreeSet<NodeId>,
    /// Node elected to run cluster-wide maintenance
    #[serde(default)]
    pub coordinator: Option<NodeId>,
}

impl MembershipSnapshot {
    pub fn new(version: u64, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            version,
            nodes: nodes.into_iter().collect(),
            coordinator: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: NodeId) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn empty() -> Self {
        Self {
            version: 0,
            nodes: BTreeSet::new(),
            coordinator: None,
        }
    }
}

/// Summary of a resident model, exposed for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub detector_id: DetectorId,
    pub size_bytes: usize,
    pub samples_seen: u64,
    pub last_used: i64,
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let config = fixtures::detector_config("d1", 2, 4);
        assert_eq!(config.dimensions(), 8);
    }

    #[test]
    fn test_detector_config_json() {
        let json = r#"{
            "detector_id": "cpu-detector",
            "entity": "host-metrics",
            "detection_interval": 600,
            "features": [{"name": "cpu", "aggregation": "avg", "field": "cpu.pct"}]
        }"#;
        let config: DetectorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.detector_id.as_str(), "cpu-detector");
        assert_eq!(config.detection_interval, Duration::from_secs(600));
        assert_eq!(config.window_delay, Duration::ZERO);
        assert_eq!(config.shingle_size, 8);
    }

    #[test]
    fn test_feature_vector_finite() {
        assert!(FeatureVector::new(vec![1.0, 2.0]).is_finite());
        assert!(!FeatureVector::new(vec![1.0, f64::NAN]).is_finite());
    }
}
