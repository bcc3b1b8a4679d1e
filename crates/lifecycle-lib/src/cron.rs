//! Periodic maintenance
//!
//! - Hourly, on every node: model maintenance (idle eviction, periodic
//!   checkpoints, pending-flush retries) and the detector state sweep
//! - Daily: reconciliation of deleted detectors and, on the coordinator
//!   only, the purge of checkpoints older than the checkpoint TTL or left
//!   behind by deleted detectors

use crate::error::Result;
use crate::manager::{MaintenanceReport, ModelManager};
use crate::observability::StructuredLogger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CronConfig {
    pub hourly_interval: Duration,
    pub daily_interval: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            hourly_interval: Duration::from_secs(3600),
            daily_interval: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct HourlyCron {
    manager: Arc<ModelManager>,
    period: Duration,
}

impl HourlyCron {
    pub fn new(manager: Arc<ModelManager>, config: &CronConfig) -> Self {
        Self {
            manager,
            period: config.hourly_interval,
        }
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        self.manager.maintenance().await
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.period.as_secs(), "Starting hourly cron");
        let mut ticker = interval_at(Instant::now() + self.period, self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down hourly cron");
                    break;
                }
            }
        }
    }
}

/// What one daily pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyReport {
    pub coordinator: bool,
    pub reconciled_deletions: usize,
    pub purged_checkpoints: usize,
    pub orphaned_checkpoints: usize,
}

pub struct DailyCron {
    manager: Arc<ModelManager>,
    checkpoint_ttl: Duration,
    period: Duration,
    logger: StructuredLogger,
}

impl DailyCron {
    pub fn new(
        manager: Arc<ModelManager>,
        checkpoint_ttl: Duration,
        config: &CronConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            manager,
            checkpoint_ttl,
            period: config.daily_interval,
            logger,
        }
    }

    pub async fn run_once(&self) -> Result<DailyReport> {
        let coordinator = self.manager.ring().is_coordinator();
        let reconciled_deletions = self.manager.reconcile_deleted(coordinator).await?;

        let mut report = DailyReport {
            coordinator,
            reconciled_deletions,
            ..Default::default()
        };
        if coordinator {
            let purged = self
                .manager
                .checkpoints()
                .delete_older_than(self.checkpoint_ttl)
                .await?;
            self.logger.log_checkpoint_purge("ttl", purged.len());
            report.purged_checkpoints = purged.len();

            report.orphaned_checkpoints = self.manager.purge_orphaned_checkpoints().await?;
            self.logger
                .log_checkpoint_purge("orphaned", report.orphaned_checkpoints);
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.period.as_secs(), "Starting daily cron");
        let mut ticker = interval_at(Instant::now() + self.period, self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => info!(
                            coordinator = report.coordinator,
                            reconciled = report.reconciled_deletions,
                            purged = report.purged_checkpoints,
                            orphaned = report.orphaned_checkpoints,
                            "Daily cron finished"
                        ),
                        Err(e) => warn!(error = %e, "Daily cron failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down daily cron");
                    break;
                }
            }
        }
    }
}
