//! Node health and resident models

use crate::client::ApiClient;
use crate::output::{
    color_status, format_bytes, format_millis, print_json, print_rows, print_success,
    print_warning, OutputFormat,
};
use anyhow::{bail, Result};
use lifecycle_lib::{ComponentStatus, HealthResponse, ModelSummary};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct NodeHealth {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeHealth {
    fn is_operational(&self) -> bool {
        self.health
            .as_ref()
            .map(|h| h.status.is_operational())
            .unwrap_or(false)
    }
}

fn status_name(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

/// Query `/healthz` on every node; 503 answers still carry the component report
pub async fn collect_health(clients: &[ApiClient]) -> Vec<NodeHealth> {
    let mut reports = Vec::with_capacity(clients.len());
    for client in clients {
        let report = match client.get_with_status::<HealthResponse>("healthz").await {
            Ok((_, health)) => NodeHealth {
                node: client.node().to_string(),
                health: Some(health),
                error: None,
            },
            Err(e) => NodeHealth {
                node: client.node().to_string(),
                health: None,
                error: Some(format!("{:#}", e)),
            },
        };
        reports.push(report);
    }
    reports
}

/// Show node health; fails when any node is unhealthy or unreachable
pub async fn show_health(clients: &[ApiClient], format: OutputFormat) -> Result<()> {
    let reports = collect_health(clients).await;

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => {
            let rows = reports
                .iter()
                .map(|report| match (&report.health, &report.error) {
                    (Some(health), _) => {
                        let problems: Vec<String> = health
                            .components
                            .iter()
                            .filter(|(_, c)| c.status != ComponentStatus::Healthy)
                            .map(|(name, c)| match &c.message {
                                Some(message) => format!("{}: {}", name, message),
                                None => format!("{}: {}", name, status_name(c.status)),
                            })
                            .collect();
                        vec![
                            report.node.clone(),
                            color_status(status_name(health.status)),
                            if problems.is_empty() {
                                "-".to_string()
                            } else {
                                problems.join("; ")
                            },
                        ]
                    }
                    (None, error) => vec![
                        report.node.clone(),
                        color_status("unreachable"),
                        error.clone().unwrap_or_default(),
                    ],
                })
                .collect();
            print_rows(
                vec!["NODE".into(), "STATUS".into(), "DETAILS".into()],
                rows,
            );
        }
    }

    let failing = reports.iter().filter(|r| !r.is_operational()).count();
    if failing > 0 {
        bail!("{} of {} node(s) unhealthy or unreachable", failing, reports.len());
    }
    if format == OutputFormat::Table {
        print_success("All nodes operational");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct NodeModels {
    pub node: String,
    pub models: Vec<ModelSummary>,
}

/// List resident models on every reachable node
pub async fn show_models(clients: &[ApiClient], format: OutputFormat) -> Result<()> {
    let mut nodes = Vec::with_capacity(clients.len());
    for client in clients {
        match client.get::<Vec<ModelSummary>>("models").await {
            Ok(models) => nodes.push(NodeModels {
                node: client.node().to_string(),
                models,
            }),
            Err(e) => print_warning(&format!("{}: {:#}", client.node(), e)),
        }
    }
    if nodes.is_empty() {
        bail!("no node answered");
    }

    match format {
        OutputFormat::Json => print_json(&nodes),
        OutputFormat::Table => {
            let rows = nodes
                .iter()
                .flat_map(|node| {
                    node.models.iter().map(move |m| {
                        vec![
                            node.node.clone(),
                            m.detector_id.to_string(),
                            format_bytes(m.size_bytes as u64),
                            m.samples_seen.to_string(),
                            format_millis(m.last_used),
                        ]
                    })
                })
                .collect();
            print_rows(
                vec![
                    "NODE".into(),
                    "DETECTOR".into(),
                    "SIZE".into(),
                    "SAMPLES".into(),
                    "LAST USED (UTC)".into(),
                ],
                rows,
            );
            Ok(())
        }
    }
}
