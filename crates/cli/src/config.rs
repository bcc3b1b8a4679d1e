//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node used when nothing else is configured
pub const DEFAULT_NODE: &str = "http://localhost:8080";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node API URLs
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Config {
    /// Load configuration from `~/.config/adctl/config.json`, if present
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("adctl").join("config.json"))
    }
}

/// Nodes to talk to: flags or `ADCTL_NODES` first, then the config file, then localhost
pub fn resolve_nodes(from_args: Vec<String>, config: &Config) -> Vec<String> {
    let pick = |nodes: &[String]| -> Vec<String> {
        nodes
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    };

    let args = pick(&from_args);
    if !args.is_empty() {
        return args;
    }
    let configured = pick(&config.nodes);
    if !configured.is_empty() {
        return configured;
    }
    vec![DEFAULT_NODE.to_string()]
}
