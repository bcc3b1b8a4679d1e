//! Execution stats per node and for the cluster

use crate::client::ApiClient;
use crate::output::{print_json, print_rows, print_warning, OutputFormat};
use anyhow::{bail, Result};
use colored::Colorize;
use lifecycle_lib::{ClusterStats, NodeStats, StatName};
use serde::Serialize;
use std::str::FromStr;

/// A node that did not answer
#[derive(Debug, Clone, Serialize)]
pub struct Unreachable {
    pub node: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    #[serde(flatten)]
    cluster: ClusterStats,
    unreachable: Vec<Unreachable>,
}

/// Fetch `/stats` from every node
pub async fn collect(clients: &[ApiClient]) -> (Vec<NodeStats>, Vec<Unreachable>) {
    let mut nodes = Vec::with_capacity(clients.len());
    let mut unreachable = Vec::new();

    for client in clients {
        match client.get::<NodeStats>("stats").await {
            Ok(stats) => nodes.push(stats),
            Err(e) => unreachable.push(Unreachable {
                node: client.node().to_string(),
                error: format!("{:#}", e),
            }),
        }
    }

    (nodes, unreachable)
}

/// Keep only `name` in every node and in the totals
fn only(cluster: &mut ClusterStats, name: StatName) {
    let key = name.as_str();
    for node in &mut cluster.nodes {
        node.stats.retain(|k, _| k == key);
    }
    cluster.totals.retain(|k, _| k == key);
}

/// Show stats of every reachable node plus cluster totals
pub async fn show_stats(clients: &[ApiClient], name: Option<&str>, format: OutputFormat) -> Result<()> {
    let filter = name.map(StatName::from_str).transpose()?;

    let (nodes, unreachable) = collect(clients).await;
    for node in &unreachable {
        print_warning(&format!("{}: {}", node.node, node.error));
    }
    if nodes.is_empty() {
        bail!("no node answered");
    }

    let mut cluster = ClusterStats::aggregate(nodes);
    if let Some(name) = filter {
        only(&mut cluster, name);
    }

    match format {
        OutputFormat::Json => print_json(&StatsReport {
            cluster,
            unreachable,
        }),
        OutputFormat::Table => {
            let names: Vec<String> = cluster.totals.keys().cloned().collect();
            let header = std::iter::once("NODE".to_string())
                .chain(names.iter().map(|n| n.to_uppercase()))
                .collect();

            let mut rows: Vec<Vec<String>> = cluster
                .nodes
                .iter()
                .map(|node| {
                    std::iter::once(node.node_id.to_string())
                        .chain(
                            names
                                .iter()
                                .map(|n| node.stats.get(n).copied().unwrap_or(0).to_string()),
                        )
                        .collect()
                })
                .collect();
            rows.push(
                std::iter::once("TOTAL".bold().to_string())
                    .chain(names.iter().map(|n| cluster.totals[n].to_string().bold().to_string()))
                    .collect(),
            );

            print_rows(header, rows);
            Ok(())
        }
    }
}
