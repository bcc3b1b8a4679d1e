//! Lifecycle configuration

use crate::checkpoint::CheckpointConfig;
use crate::cron::CronConfig;
use crate::detector::StateConfig;
use crate::error::{LifecycleError, Result};
use crate::manager::{CacheConfig, ColdStartConfig};
use crate::model::ModelFactoryConfig;
use crate::ring::RingConfig;
use std::time::Duration;

/// Configuration of every lifecycle component
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    pub ring: RingConfig,
    pub cache: CacheConfig,
    pub state: StateConfig,
    pub cold_start: ColdStartConfig,
    pub checkpoint: CheckpointConfig,
    pub cron: CronConfig,
    pub model: ModelFactoryConfig,
}

fn invalid(message: impl Into<String>) -> LifecycleError {
    LifecycleError::Config(message.into())
}

fn positive(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(invalid(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring.virtual_nodes == 0 {
            return Err(invalid("ring.virtual_nodes must be at least 1"));
        }

        let cache = &self.cache;
        if cache.memory_limit_bytes == 0 {
            return Err(invalid("cache.memory_limit_bytes must be greater than zero"));
        }
        if !(cache.model_max_size_percentage > 0.0 && cache.model_max_size_percentage <= 1.0) {
            return Err(invalid("cache.model_max_size_percentage must be in (0, 1]"));
        }
        if !(0.0 < cache.low_watermark
            && cache.low_watermark < cache.high_watermark
            && cache.high_watermark <= 1.0)
        {
            return Err(invalid(format!(
                "cache watermarks must satisfy 0 < low < high <= 1 (low={}, high={})",
                cache.low_watermark, cache.high_watermark
            )));
        }
        positive("cache.model_idle_ttl", cache.model_idle_ttl)?;
        positive("cache.checkpoint_interval", cache.checkpoint_interval)?;
        positive("cache.evictor_interval", cache.evictor_interval)?;

        positive("state.state_ttl", self.state.state_ttl)?;

        if self.cold_start.workers == 0 {
            return Err(invalid("cold_start.workers must be at least 1"));
        }
        if self.cold_start.queue_capacity == 0 {
            return Err(invalid("cold_start.queue_capacity must be at least 1"));
        }

        positive("checkpoint.ttl", self.checkpoint.ttl)?;
        positive("cron.hourly_interval", self.cron.hourly_interval)?;
        positive("cron.daily_interval", self.cron.daily_interval)?;

        if self.model.min_training_samples == 0 {
            return Err(invalid("model.min_training_samples must be at least 1"));
        }
        Ok(())
    }
}
