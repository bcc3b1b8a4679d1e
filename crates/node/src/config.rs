//! Node configuration

use anyhow::{bail, Context, Result};
use lifecycle_lib::checkpoint::CheckpointConfig;
use lifecycle_lib::cron::CronConfig;
use lifecycle_lib::detector::StateConfig;
use lifecycle_lib::manager::{CacheConfig, ColdStartConfig};
use lifecycle_lib::model::ModelFactoryConfig;
use lifecycle_lib::ring::RingConfig;
use lifecycle_lib::{LifecycleConfig, MembershipSnapshot, NodeId};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "ADNODE_CONFIG";

/// Node configuration
///
/// Read from the optional file named by `ADNODE_CONFIG`, then from
/// `ADNODE_`-prefixed environment variables (e.g. `ADNODE_API_PORT`).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node in the cluster
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// API server port for scoring, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Root of the file-backed checkpoint and detector stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Other nodes known at startup
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Node running cluster-wide maintenance; lowest node id when unset
    #[serde(default)]
    pub coordinator: Option<String>,

    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default = "default_model_max_size_percentage")]
    pub model_max_size_percentage: f64,

    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,

    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    #[serde(default = "default_hour_secs")]
    pub model_idle_ttl_secs: u64,

    #[serde(default = "default_hour_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_evictor_interval")]
    pub evictor_interval_secs: u64,

    /// TTL of cached detector configuration
    #[serde(default = "default_hour_secs")]
    pub state_ttl_secs: u64,

    /// How long a failing detector is reported unhealthy
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown_secs: u64,

    #[serde(default = "default_cold_start_workers")]
    pub cold_start_workers: usize,

    #[serde(default = "default_cold_start_queue")]
    pub cold_start_queue: usize,

    /// Checkpoints older than this are ignored and purged
    #[serde(default = "default_checkpoint_ttl")]
    pub checkpoint_ttl_secs: u64,

    #[serde(default = "default_hour_secs")]
    pub hourly_interval_secs: u64,

    #[serde(default = "default_daily_interval")]
    pub daily_interval_secs: u64,

    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Historical vectors required before a model is trained
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,

    /// Observed vectors kept per detector for training
    #[serde(default = "default_feature_window")]
    pub feature_window: usize,
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node-0".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ad-node")
}

fn default_memory_limit_mb() -> u64 {
    1024
}

fn default_model_max_size_percentage() -> f64 {
    0.1
}

fn default_high_watermark() -> f64 {
    0.95
}

fn default_low_watermark() -> f64 {
    0.8
}

fn default_hour_secs() -> u64 {
    3600
}

fn default_evictor_interval() -> u64 {
    10
}

fn default_error_cooldown() -> u64 {
    300
}

fn default_cold_start_workers() -> usize {
    4
}

fn default_cold_start_queue() -> usize {
    256
}

fn default_checkpoint_ttl() -> u64 {
    3 * 24 * 3600
}

fn default_daily_interval() -> u64 {
    24 * 3600
}

fn default_virtual_nodes() -> usize {
    100
}

fn default_min_training_samples() -> usize {
    128
}

fn default_feature_window() -> usize {
    1024
}

impl NodeConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("ADNODE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("seed_nodes"),
            )
            .build()
            .context("failed to read node configuration")?;

        let node: NodeConfig = config
            .try_deserialize()
            .context("invalid node configuration")?;
        node.validate()?;
        Ok(node)
    }

    /// Node-level checks; component settings are checked by `LifecycleConfig::validate`
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id must not be empty");
        }
        if self.feature_window < self.min_training_samples {
            bail!(
                "feature_window ({}) must hold at least min_training_samples ({})",
                self.feature_window,
                self.min_training_samples
            );
        }
        self.lifecycle_config()
            .validate()
            .context("invalid lifecycle settings")?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.as_str())
    }

    /// Membership known at startup: this node plus the seed nodes
    pub fn initial_membership(&self) -> MembershipSnapshot {
        let snapshot = MembershipSnapshot::new(
            1,
            std::iter::once(self.node_id())
                .chain(self.seed_nodes.iter().map(|n| NodeId::new(n.trim()))),
        );
        let coordinator = match &self.coordinator {
            Some(node) => Some(NodeId::new(node.as_str())),
            None => snapshot.nodes.iter().next().cloned(),
        };
        match coordinator {
            Some(node) => snapshot.with_coordinator(node),
            None => snapshot,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let secs = Duration::from_secs;
        LifecycleConfig {
            ring: RingConfig {
                virtual_nodes: self.virtual_nodes,
            },
            cache: CacheConfig {
                memory_limit_bytes: self.memory_limit_mb * 1024 * 1024,
                model_max_size_percentage: self.model_max_size_percentage,
                high_watermark: self.high_watermark,
                low_watermark: self.low_watermark,
                model_idle_ttl: secs(self.model_idle_ttl_secs),
                checkpoint_interval: secs(self.checkpoint_interval_secs),
                evictor_interval: secs(self.evictor_interval_secs),
            },
            state: StateConfig {
                state_ttl: secs(self.state_ttl_secs),
                error_cooldown: secs(self.error_cooldown_secs),
            },
            cold_start: ColdStartConfig {
                workers: self.cold_start_workers,
                queue_capacity: self.cold_start_queue,
            },
            checkpoint: CheckpointConfig {
                ttl: secs(self.checkpoint_ttl_secs),
            },
            cron: CronConfig {
                hourly_interval: secs(self.hourly_interval_secs),
                daily_interval: secs(self.daily_interval_secs),
            },
            model: ModelFactoryConfig {
                min_training_samples: self.min_training_samples,
                ..ModelFactoryConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> NodeConfig {
        config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = from_json(r#"{"node_id": "node-a"}"#);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.checkpoint_ttl_secs, 259_200);
        assert!(config.validate().is_ok());

        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.cache.memory_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(lifecycle.cold_start.workers, 4);
    }

    #[test]
    fn test_membership_defaults_coordinator_to_lowest_node() {
        let config = from_json(r#"{"node_id": "node-c", "seed_nodes": ["node-b", "node-a"]}"#);
        let snapshot = config.initial_membership();
        assert_eq!(snapshot.nodes.len(), 3);
        assert_eq!(snapshot.coordinator, Some(NodeId::new("node-a")));

        let pinned = from_json(r#"{"node_id": "node-c", "coordinator": "node-c"}"#);
        assert_eq!(
            pinned.initial_membership().coordinator,
            Some(NodeId::new("node-c"))
        );
    }

    #[test]
    fn test_invalid_watermarks_rejected() {
        let config = from_json(r#"{"node_id": "node-a", "high_watermark": 0.5, "low_watermark": 0.9}"#);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_smaller_than_training_set_rejected() {
        let config =
            from_json(r#"{"node_id": "node-a", "min_training_samples": 64, "feature_window": 32}"#);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("feature_window"));
    }
}
