//! Bounded worker pool for cold-start jobs

use crate::error::Result;
use crate::models::DetectorId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ColdStartConfig {
    /// Concurrent training jobs
    pub workers: usize,
    /// Jobs waiting for a worker; submissions beyond this are rejected
    pub queue_capacity: usize,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// How a cold-start job produced its model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartOutcome {
    /// Restored from a checkpoint
    WarmStarted,
    /// Trained from historical features
    Trained,
    /// Another path already installed a model
    AlreadyResident,
}

impl ColdStartOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdStartOutcome::WarmStarted => "warm_started",
            ColdStartOutcome::Trained => "trained",
            ColdStartOutcome::AlreadyResident => "already_resident",
        }
    }
}

/// Result of `ColdStartRunner::submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    AlreadyPending,
    /// Queue full or runner stopped
    Rejected,
}

/// Work performed for one detector by a runner worker
#[async_trait]
pub trait ColdStartTask: Send + Sync {
    async fn run(&self, detector_id: &DetectorId) -> Result<ColdStartOutcome>;
}

pub struct ColdStartRunner {
    sender: std::sync::Mutex<Option<mpsc::Sender<DetectorId>>>,
    pending: Arc<DashMap<DetectorId, ()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Jobs that fit in the queue plus the ones being worked on
    capacity: usize,
}

impl ColdStartRunner {
    /// Spawn `config.workers` workers running `task`
    pub fn start(config: &ColdStartConfig, task: Arc<dyn ColdStartTask>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let pending: Arc<DashMap<DetectorId, ()>> = Arc::new(DashMap::new());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let pending = Arc::clone(&pending);
                let task = Arc::clone(&task);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(detector_id) = next else {
                            break;
                        };

                        debug!(worker, detector_id = %detector_id, "Running cold start");
                        if let Err(e) = task.run(&detector_id).await {
                            debug!(worker, detector_id = %detector_id, error = %e, "Cold start job failed");
                        }
                        pending.remove(&detector_id);
                    }
                    debug!(worker, "Cold-start worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity,
            "Started cold-start runner"
        );

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            pending,
            workers: Mutex::new(workers),
            capacity: config.queue_capacity.max(1) + config.workers.max(1),
        }
    }

    /// Queue a cold start unless one is already pending for the detector
    pub fn submit(&self, detector_id: &DetectorId) -> SubmitOutcome {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            return SubmitOutcome::Rejected;
        };

        match self.pending.entry(detector_id.clone()) {
            Entry::Occupied(_) => SubmitOutcome::AlreadyPending,
            Entry::Vacant(vacant) => match sender.try_send(detector_id.clone()) {
                Ok(()) => {
                    vacant.insert(());
                    SubmitOutcome::Accepted
                }
                Err(e) => {
                    warn!(detector_id = %detector_id, error = %e, "Cold-start queue rejected job");
                    SubmitOutcome::Rejected
                }
            },
        }
    }

    pub fn is_pending(&self, detector_id: &DetectorId) -> bool {
        self.pending.contains_key(detector_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True when new submissions are likely to be rejected
    pub fn is_saturated(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Stop accepting jobs, let queued ones finish, and wait for the workers
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cold-start worker panicked");
            }
        }
        info!("Cold-start runner stopped");
    }
}

impl std::fmt::Debug for ColdStartRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdStartRunner")
            .field("pending", &self.pending.len())
            .finish()
    }
}
