//! Reference threshold model
//!
//! Calibrates raw forest scores into a grade in [0, 1]. Scores below
//! `mean + z_threshold * std` of the recent raw-score distribution grade 0;
//! above it the grade grows linearly and saturates at twice the threshold.

use super::stats::DecayingStats;
use super::{ModelError, ThresholdModel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreThreshold {
    scores: DecayingStats,
    z_threshold: f64,
    /// Samples needed before any non-zero grade is emitted
    min_samples: u64,
}

impl ScoreThreshold {
    pub fn new(decay: f64, z_threshold: f64, min_samples: u64) -> Self {
        Self {
            scores: DecayingStats::new(decay),
            z_threshold: z_threshold.max(f64::EPSILON),
            min_samples,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))
    }

    fn compute_grade(&self, raw: f64) -> f64 {
        if self.scores.count < self.min_samples {
            return 0.0;
        }
        let z = self.scores.z_score(raw);
        if z <= self.z_threshold {
            0.0
        } else {
            ((z - self.z_threshold) / self.z_threshold).min(1.0)
        }
    }
}

impl ThresholdModel for ScoreThreshold {
    fn grade(&self, raw_score: f64) -> f64 {
        self.compute_grade(raw_score)
    }

    fn update(&mut self, raw_score: f64) -> f64 {
        let grade = self.compute_grade(raw_score);
        self.scores.add_sample(raw_score);
        grade
    }

    fn confidence(&self) -> f64 {
        let n = self.scores.count as f64;
        n / (n + self.min_samples.max(1) as f64)
    }

    fn samples_seen(&self) -> u64 {
        self.scores.count
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn serialize(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Encode(e.to_string()))
    }
}
