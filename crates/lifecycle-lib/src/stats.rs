//! Execution counters, per node and aggregated across the cluster

use crate::error::{LifecycleError, Result};
use crate::models::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The fixed set of stat names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatName {
    ExecuteRequestCount,
    ExecuteFailureCount,
}

impl StatName {
    pub const ALL: [StatName; 2] = [StatName::ExecuteRequestCount, StatName::ExecuteFailureCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatName::ExecuteRequestCount => "execute_request_count",
            StatName::ExecuteFailureCount => "execute_failure_count",
        }
    }

    fn index(&self) -> usize {
        match self {
            StatName::ExecuteRequestCount => 0,
            StatName::ExecuteFailureCount => 1,
        }
    }
}

impl fmt::Display for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatName {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        StatName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| LifecycleError::UnknownStat(s.to_string()))
    }
}

/// Process-lifetime counters
///
/// Constructed once by the composition root and handed to whatever
/// increments or reads them. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    counters: Arc<[AtomicU64; 2]>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: StatName) {
        self.counters[name.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, name: StatName) -> u64 {
        self.counters[name.index()].load(Ordering::Relaxed)
    }

    /// Look up a stat by its string key
    pub fn get_by_name(&self, name: &str) -> Result<u64> {
        Ok(self.get(name.parse()?))
    }

    pub fn snapshot(&self, node_id: &NodeId) -> NodeStats {
        NodeStats {
            node_id: node_id.clone(),
            stats: StatName::ALL
                .into_iter()
                .map(|name| (name.as_str().to_string(), self.get(name)))
                .collect(),
        }
    }
}

/// Stats reported by one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub stats: BTreeMap<String, u64>,
}

/// Stats of several nodes plus their totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub nodes: Vec<NodeStats>,
    pub totals: BTreeMap<String, u64>,
}

impl ClusterStats {
    /// Sum node responses; names a node does not report count as zero
    pub fn aggregate(nodes: Vec<NodeStats>) -> Self {
        let mut totals: BTreeMap<String, u64> = StatName::ALL
            .into_iter()
            .map(|name| (name.as_str().to_string(), 0))
            .collect();

        for node in &nodes {
            for (name, value) in &node.stats {
                *totals.entry(name.clone()).or_default() += value;
            }
        }

        Self { nodes, totals }
    }

    pub fn total(&self, name: StatName) -> u64 {
        self.totals.get(name.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.increment(StatName::ExecuteRequestCount);
        stats.increment(StatName::ExecuteRequestCount);
        stats.increment(StatName::ExecuteFailureCount);

        assert_eq!(stats.get(StatName::ExecuteRequestCount), 2);
        assert_eq!(stats.get_by_name("execute_failure_count").unwrap(), 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let stats = Stats::new();
        let handle = stats.clone();
        handle.increment(StatName::ExecuteRequestCount);
        assert_eq!(stats.get(StatName::ExecuteRequestCount), 1);
    }

    #[test]
    fn test_unknown_stat_is_rejected() {
        let stats = Stats::new();
        let err = stats.get_by_name("models_trained").unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownStat(name) if name == "models_trained"));
    }

    #[test]
    fn test_cluster_aggregation() {
        let a = Stats::new();
        let b = Stats::new();
        for _ in 0..3 {
            a.increment(StatName::ExecuteRequestCount);
        }
        b.increment(StatName::ExecuteRequestCount);
        b.increment(StatName::ExecuteFailureCount);

        let cluster = ClusterStats::aggregate(vec![
            a.snapshot(&NodeId::new("node-a")),
            b.snapshot(&NodeId::new("node-b")),
        ]);

        assert_eq!(cluster.total(StatName::ExecuteRequestCount), 4);
        assert_eq!(cluster.total(StatName::ExecuteFailureCount), 1);
        assert_eq!(cluster.nodes.len(), 2);
    }

    #[test]
    fn test_snapshot_json_keys() {
        let stats = Stats::new();
        let json = serde_json::to_value(stats.snapshot(&NodeId::new("n1"))).unwrap();
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["stats"]["execute_request_count"], 0);
        assert_eq!(json["stats"]["execute_failure_count"], 0);
    }
}
