//! Reference forest model
//!
//! Scores a shingled vector by how far each coordinate sits from its own
//! decaying distribution, combined as the root mean square of the clipped
//! z-scores. Scoring happens before the vector is folded in, so a point is
//! judged against history only.

use super::stats::DecayingStats;
use super::{ForestModel, ModelError};
use serde::{Deserialize, Serialize};

/// Z-scores beyond this are clipped so one coordinate cannot dominate
const MAX_Z: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingStatsForest {
    cells: Vec<DecayingStats>,
    samples_seen: u64,
}

impl StreamingStatsForest {
    pub fn new(dimensions: usize, decay: f64) -> Self {
        Self {
            cells: (0..dimensions).map(|_| DecayingStats::new(decay)).collect(),
            samples_seen: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))
    }
}

impl ForestModel for StreamingStatsForest {
    fn score(&self, point: &[f64]) -> f64 {
        if self.cells.is_empty() || self.samples_seen < 2 {
            return 0.0;
        }
        let sum: f64 = self
            .cells
            .iter()
            .zip(point)
            .map(|(cell, value)| cell.z_score(*value).abs().min(MAX_Z).powi(2))
            .sum();
        (sum / self.cells.len() as f64).sqrt()
    }

    fn update(&mut self, point: &[f64]) -> f64 {
        let score = self.score(point);
        for (cell, value) in self.cells.iter_mut().zip(point) {
            cell.add_sample(*value);
        }
        self.samples_seen += 1;
        score
    }

    fn dimensions(&self) -> usize {
        self.cells.len()
    }

    fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.cells.len() * std::mem::size_of::<DecayingStats>()
    }

    fn serialize(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Encode(e.to_string()))
    }
}
