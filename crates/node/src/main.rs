//! ad-node - anomaly detection node
//!
//! Owns a share of the cluster's detectors, keeps their models in memory
//! within a budget, and serves scoring, health and metrics over HTTP.

use ad_node::{api, config::NodeConfig};
use anyhow::{Context, Result};
use lifecycle_lib::checkpoint::FileCheckpointStore;
use lifecycle_lib::detector::FileDetectorStore;
use lifecycle_lib::features::ObservedFeatureSource;
use lifecycle_lib::model::DefaultModelFactory;
use lifecycle_lib::{Collaborators, Lifecycle};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting ad-node");

    let config = NodeConfig::load()?;
    info!(node_id = %config.node_id, data_dir = %config.data_dir.display(), "Node configured");

    let lifecycle_config = config.lifecycle_config();
    let collaborators = Collaborators {
        checkpoint_store: Arc::new(
            FileCheckpointStore::new(config.data_dir.join("checkpoints")).await?,
        ),
        detector_store: Arc::new(FileDetectorStore::new(config.data_dir.join("detectors")).await?),
        features: Arc::new(ObservedFeatureSource::new(config.feature_window)),
        factory: Arc::new(DefaultModelFactory::new(lifecycle_config.model.clone())),
    };

    let lifecycle = Arc::new(
        Lifecycle::build(
            config.node_id(),
            config.initial_membership(),
            lifecycle_config,
            collaborators,
        )
        .await
        .context("failed to start lifecycle")?,
    );
    lifecycle.logger.log_startup(NODE_VERSION);

    let app_state = Arc::new(api::AppState::new(Arc::clone(&lifecycle)));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };
    api::serve(config.api_port, app_state, shutdown).await?;

    info!("Shutting down");
    let flushed = lifecycle.shutdown().await;
    lifecycle.logger.log_shutdown("SIGINT received", flushed);

    Ok(())
}
