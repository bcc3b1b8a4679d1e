//! Detector ownership and scoring

use crate::client::{ApiClient, ErrorResponse, OwnerResponse, ScoreRequest};
use crate::output::{
    color_grade, format_millis, print_info, print_json, print_rows, print_warning, OutputFormat,
};
use anyhow::{anyhow, bail, Context, Result};
use lifecycle_lib::AnomalyResult;
use reqwest::StatusCode;
use serde::Serialize;

/// Ask the nodes in turn until one resolves the owner
pub async fn find_owner(clients: &[ApiClient], detector_id: &str) -> Result<OwnerResponse> {
    let path = format!("detectors/{}/owner", detector_id);
    let mut last_error = None;
    for client in clients {
        match client.get::<OwnerResponse>(&path).await {
            Ok(owner) => return Ok(owner),
            Err(e) => last_error = Some(e.context(format!("{} could not resolve the owner", client.node()))),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("no nodes configured")))
}

pub async fn show_owner(clients: &[ApiClient], detector_id: &str, format: OutputFormat) -> Result<()> {
    let owner = find_owner(clients, detector_id).await?;
    match format {
        OutputFormat::Json => print_json(&owner),
        OutputFormat::Table => {
            print_rows(
                vec!["DETECTOR".into(), "OWNER".into(), "RING VERSION".into()],
                vec![vec![
                    owner.detector_id.clone(),
                    owner.owner.clone(),
                    owner.ring_version.to_string(),
                ]],
            );
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoreOutcome {
    Scored { node: String, result: AnomalyResult },
    /// Owner accepted the request and queued a cold start
    NotReady { node: String, message: String },
}

/// Score on whichever configured node owns the detector
///
/// Nodes answering 409 are skipped; the owner hint from the last one is
/// reported when no configured node owns the detector.
pub async fn score_on_cluster(
    clients: &[ApiClient],
    detector_id: &str,
    features: Vec<f64>,
) -> Result<ScoreOutcome> {
    let path = format!("detectors/{}/score", detector_id);
    let request = ScoreRequest { features };
    let mut owner_hint = None;

    for client in clients {
        let node = client.node().to_string();
        let (status, body) = match client
            .post_with_status::<serde_json::Value, _>(&path, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                print_warning(&format!("{:#}", e));
                continue;
            }
        };

        if status == StatusCode::OK {
            let result = serde_json::from_value(body).context("Failed to parse score result")?;
            return Ok(ScoreOutcome::Scored { node, result });
        }

        let error: ErrorResponse = serde_json::from_value(body)
            .with_context(|| format!("{} answered {} without an error body", node, status))?;
        match status {
            StatusCode::CONFLICT => owner_hint = error.owner,
            StatusCode::ACCEPTED => {
                return Ok(ScoreOutcome::NotReady {
                    node,
                    message: error.error,
                })
            }
            _ => bail!("{} ({}): {}", node, error.kind, error.error),
        }
    }

    match owner_hint {
        Some(owner) => bail!(
            "detector {} is owned by {}, which is not among the configured nodes",
            detector_id,
            owner
        ),
        None => bail!("no configured node could score detector {}", detector_id),
    }
}

pub async fn show_score(
    clients: &[ApiClient],
    detector_id: &str,
    features: Vec<f64>,
    format: OutputFormat,
) -> Result<()> {
    let outcome = score_on_cluster(clients, detector_id, features).await?;
    if format == OutputFormat::Json {
        return print_json(&outcome);
    }

    match outcome {
        ScoreOutcome::Scored { node, result } => print_rows(
            vec![
                "DETECTOR".into(),
                "NODE".into(),
                "SCORE".into(),
                "GRADE".into(),
                "CONFIDENCE".into(),
                "SCORED AT (UTC)".into(),
            ],
            vec![vec![
                result.detector_id.to_string(),
                node,
                format!("{:.4}", result.score),
                color_grade(result.grade),
                format!("{:.0}%", result.confidence * 100.0),
                format_millis(result.scored_at),
            ]],
        ),
        ScoreOutcome::NotReady { node, message } => {
            print_info(&format!("{} on {}; a cold start is queued, retry shortly", message, node))
        }
    }
    Ok(())
}
