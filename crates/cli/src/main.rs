//! Anomaly detection cluster CLI
//!
//! Queries ad-node instances for execution stats, health, detector
//! ownership and resident models, and scores feature vectors on the
//! node that owns the detector.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::ApiClient;
use commands::{cluster, detectors, stats};

/// Anomaly detection cluster CLI
#[derive(Parser)]
#[command(name = "adctl")]
#[command(author, version, about = "CLI for the anomaly detection cluster", long_about = None)]
pub struct Cli {
    /// Node API URL, repeatable (can also be set via ADCTL_NODES, comma separated)
    #[arg(long = "node", env = "ADCTL_NODES", value_delimiter = ',', global = true)]
    pub nodes: Vec<String>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show execution stats per node and cluster totals
    Stats {
        /// Only show this stat (e.g. execute_request_count)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show health of every node
    Health,

    /// Show which node owns a detector
    Owner {
        /// Detector ID
        detector_id: String,
    },

    /// Score a feature vector on the owning node
    Score {
        /// Detector ID
        detector_id: String,

        /// Feature values
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
    },

    /// List models resident in memory
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let nodes = config::resolve_nodes(cli.nodes, &config);
    let clients = nodes
        .iter()
        .map(|node| ApiClient::new(node))
        .collect::<Result<Vec<_>>>()?;

    match cli.command {
        Commands::Stats { name } => stats::show_stats(&clients, name.as_deref(), cli.format).await?,
        Commands::Health => cluster::show_health(&clients, cli.format).await?,
        Commands::Owner { detector_id } => {
            detectors::show_owner(&clients, &detector_id, cli.format).await?
        }
        Commands::Score {
            detector_id,
            values,
        } => detectors::show_score(&clients, &detector_id, values, cli.format).await?,
        Commands::Models => cluster::show_models(&clients, cli.format).await?,
    }

    Ok(())
}
