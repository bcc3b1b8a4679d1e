//! Consistent-hash ring mapping detectors to owning nodes
//!
//! Every node builds the same ring from the same membership snapshot, so
//! ownership is agreed on without coordination. Each physical node is placed
//! on the ring at `virtual_nodes` points; a membership change only moves the
//! detectors whose ranges border the joining or departing node.

use crate::error::{LifecycleError, Result};
use crate::models::{DetectorId, MembershipSnapshot, NodeId};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Default number of ring points per physical node
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// Configuration for the hash ring
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Ring points per physical node
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// Immutable ring built from one membership snapshot
#[derive(Debug, Clone)]
pub struct HashRing {
    version: u64,
    local_node: NodeId,
    nodes: BTreeSet<NodeId>,
    coordinator: Option<NodeId>,
    /// Sorted by (hash, node)
    points: Vec<(u64, NodeId)>,
}

impl HashRing {
    /// Build a ring for `snapshot` as seen from `local_node`
    pub fn build(snapshot: &MembershipSnapshot, local_node: NodeId, config: &RingConfig) -> Self {
        let replicas = config.virtual_nodes.max(1);
        let mut points = Vec::with_capacity(snapshot.nodes.len() * replicas);

        for node in &snapshot.nodes {
            for replica in 0..replicas {
                let key = format!("{}#{}", node, replica);
                points.push((stable_hash(key.as_bytes()), node.clone()));
            }
        }
        points.sort();

        Self {
            version: snapshot.version,
            local_node,
            nodes: snapshot.nodes.clone(),
            coordinator: snapshot.coordinator.clone(),
            points,
        }
    }

    /// An empty ring that resolves no owners
    pub fn empty(local_node: NodeId) -> Self {
        Self::build(&MembershipSnapshot::empty(), local_node, &RingConfig::default())
    }

    /// Owning node for a detector
    ///
    /// Returns `ClusterUnavailable` when the membership is empty. Callers
    /// must not cache that result.
    pub fn owner_of(&self, detector_id: &DetectorId) -> Result<NodeId> {
        if self.points.is_empty() {
            return Err(LifecycleError::ClusterUnavailable);
        }

        let hash = stable_hash(detector_id.as_str().as_bytes());
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, node) = if idx == self.points.len() {
            &self.points[0]
        } else {
            &self.points[idx]
        };

        Ok(node.clone())
    }

    /// Whether the local node owns the detector
    pub fn is_local(&self, detector_id: &DetectorId) -> Result<bool> {
        Ok(self.owner_of(detector_id)? == self.local_node)
    }

    /// Whether the local node is the elected coordinator
    pub fn is_coordinator(&self) -> bool {
        self.coordinator.as_ref() == Some(&self.local_node)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Hash that is stable across processes and restarts
///
/// First 8 bytes of SHA-256, big-endian.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}
