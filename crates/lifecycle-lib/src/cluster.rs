//! Cluster membership handling
//!
//! Membership changes arrive as versioned events and are applied by one
//! listener task, in order. Each applied change rebuilds the hash ring,
//! publishes it through a watch channel, and hands off models the local
//! node no longer owns.

use crate::error::{LifecycleError, Result};
use crate::health::{components, HealthRegistry};
use crate::manager::ModelManager;
use crate::models::{MembershipSnapshot, NodeId};
use crate::observability::{LifecycleMetrics, StructuredLogger};
use crate::ring::{HashRing, RingConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

/// Membership notification from the cluster's consensus layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    NodeJoined { version: u64, node: NodeId },
    NodeLeft { version: u64, node: NodeId },
    Snapshot(MembershipSnapshot),
}

impl MembershipEvent {
    pub fn version(&self) -> u64 {
        match self {
            MembershipEvent::NodeJoined { version, .. } | MembershipEvent::NodeLeft { version, .. } => {
                *version
            }
            MembershipEvent::Snapshot(snapshot) => snapshot.version,
        }
    }
}

/// Result of applying one membership event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MembershipOutcome {
    Applied { version: u64, nodes: usize, handed_off: usize },
    /// Event version not newer than the current view
    Stale { current_version: u64 },
}

/// Current membership view; the only place versions are compared
#[derive(Debug, Clone)]
pub struct MembershipTable {
    current: MembershipSnapshot,
}

impl MembershipTable {
    pub fn new(initial: MembershipSnapshot) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> &MembershipSnapshot {
        &self.current
    }

    /// Apply an event; `None` when its version is stale
    pub fn apply(&mut self, event: MembershipEvent) -> Option<&MembershipSnapshot> {
        if event.version() <= self.current.version {
            return None;
        }

        match event {
            MembershipEvent::NodeJoined { version, node } => {
                self.current.version = version;
                self.current.nodes.insert(node);
            }
            MembershipEvent::NodeLeft { version, node } => {
                self.current.version = version;
                self.current.nodes.remove(&node);
                if self.current.coordinator.as_ref() == Some(&node) {
                    self.current.coordinator = None;
                }
            }
            MembershipEvent::Snapshot(snapshot) => {
                self.current = snapshot;
            }
        }
        Some(&self.current)
    }
}

/// Create the ring channel seeded with the initial membership
pub fn ring_channel(
    initial: &MembershipSnapshot,
    local_node: NodeId,
    config: &RingConfig,
) -> (watch::Sender<Arc<HashRing>>, watch::Receiver<Arc<HashRing>>) {
    watch::channel(Arc::new(HashRing::build(initial, local_node, config)))
}

type Request = (MembershipEvent, oneshot::Sender<MembershipOutcome>);

/// Sender side used by the node to feed membership events
#[derive(Debug, Clone)]
pub struct MembershipHandle {
    sender: mpsc::Sender<Request>,
}

impl MembershipHandle {
    /// Submit an event and wait until the listener has applied it
    pub async fn apply(&self, event: MembershipEvent) -> Result<MembershipOutcome> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender
            .send((event, ack_tx))
            .await
            .map_err(|_| LifecycleError::ClusterUnavailable)?;
        ack_rx.await.map_err(|_| LifecycleError::ClusterUnavailable)
    }
}

/// Single task that serializes membership changes
pub struct ClusterEventListener {
    table: MembershipTable,
    local_node: NodeId,
    ring_config: RingConfig,
    ring_tx: watch::Sender<Arc<HashRing>>,
    manager: Arc<ModelManager>,
    health: HealthRegistry,
    metrics: LifecycleMetrics,
    logger: StructuredLogger,
}

impl ClusterEventListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial: MembershipSnapshot,
        local_node: NodeId,
        ring_config: RingConfig,
        ring_tx: watch::Sender<Arc<HashRing>>,
        manager: Arc<ModelManager>,
        health: HealthRegistry,
        metrics: LifecycleMetrics,
        logger: StructuredLogger,
    ) -> Self {
        metrics.set_ring_version(initial.version);
        Self {
            table: MembershipTable::new(initial),
            local_node,
            ring_config,
            ring_tx,
            manager,
            health,
            metrics,
            logger,
        }
    }

    /// Channel feeding this listener
    pub fn channel(capacity: usize) -> (MembershipHandle, mpsc::Receiver<Request>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (MembershipHandle { sender }, receiver)
    }

    /// Apply one event: rebuild and publish the ring, then hand off
    pub async fn handle(&mut self, event: MembershipEvent) -> MembershipOutcome {
        let current_version = self.table.current().version;
        let event_version = event.version();
        let Some(snapshot) = self.table.apply(event) else {
            debug!(
                event_version,
                current_version, "Ignoring stale membership event"
            );
            return MembershipOutcome::Stale { current_version };
        };

        let ring = Arc::new(HashRing::build(
            snapshot,
            self.local_node.clone(),
            &self.ring_config,
        ));
        self.ring_tx.send_replace(Arc::clone(&ring));
        self.metrics.set_ring_version(ring.version());

        if ring.is_empty() {
            self.health
                .set_unhealthy(components::HASH_RING, "membership is empty")
                .await;
        } else {
            self.health.set_healthy(components::HASH_RING).await;
        }

        let handed_off = self.manager.handoff(&ring).await;
        self.logger
            .log_ring_rebuilt(ring.version(), ring.nodes().len(), handed_off);

        MembershipOutcome::Applied {
            version: ring.version(),
            nodes: ring.nodes().len(),
            handed_off,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Request>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(node = %self.local_node, "Starting cluster event listener");

        loop {
            tokio::select! {
                request = events.recv() => {
                    let Some((event, ack)) = request else {
                        break;
                    };
                    let outcome = self.handle(event).await;
                    let _ = ack.send(outcome);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down cluster event listener");
                    break;
                }
            }
        }
    }
}
