//! Decaying mean/variance used by the reference models
//!
//! Exact running mean and variance (Welford) until `1 / decay` samples have
//! been seen, then exponentially weighted so old behaviour fades out.

use serde::{Deserialize, Serialize};

/// Streaming statistics over one value stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayingStats {
    pub mean: f64,
    pub variance: f64,
    pub count: u64,
    decay: f64,
}

impl DecayingStats {
    pub fn new(decay: f64) -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            count: 0,
            decay: decay.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Fold a sample into the statistics
    pub fn add_sample(&mut self, value: f64) {
        self.count += 1;
        let weight = (1.0 / self.count as f64).max(self.decay);
        let delta = value - self.mean;
        self.mean += weight * delta;
        self.variance = (1.0 - weight) * (self.variance + weight * delta * delta);
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Standard score of `value`, 0 when the stream has no spread yet
    pub fn z_score(&self, value: f64) -> f64 {
        let std_dev = self.std_dev();
        if self.count < 2 || std_dev < f64::EPSILON {
            return 0.0;
        }
        (value - self.mean) / std_dev
    }
}
