//! HTTP API: health, metrics, stats, scoring and lifecycle notifications

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use lifecycle_lib::cluster::MembershipEvent;
use lifecycle_lib::{
    ComponentStatus, DetectorConfig, DetectorId, FeatureVector, Lifecycle, LifecycleError,
    MembershipSnapshot, NodeId,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub features: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
    /// Set when the detector belongs to another node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatValue {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OwnerResponse {
    pub detector_id: DetectorId,
    pub owner: NodeId,
    pub local: bool,
    pub ring_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub detector_id: DetectorId,
    pub was_resident: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub detector_id: DetectorId,
    pub existed: bool,
}

/// Lifecycle error rendered as a JSON body with a matching status code
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                kind: "bad_request".to_string(),
                retryable: false,
                owner: None,
            },
        }
    }
}

pub fn status_for(error: &LifecycleError) -> StatusCode {
    match error {
        LifecycleError::NotReady(_) => StatusCode::ACCEPTED,
        LifecycleError::NotOwner { .. } => StatusCode::CONFLICT,
        LifecycleError::Unhealthy { .. }
        | LifecycleError::ClusterUnavailable
        | LifecycleError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::InvalidFeatures(_) => StatusCode::BAD_REQUEST,
        LifecycleError::DetectorNotFound(_) | LifecycleError::UnknownStat(_) => StatusCode::NOT_FOUND,
        LifecycleError::TrainingFailed { .. }
        | LifecycleError::CheckpointCorrupt { .. }
        | LifecycleError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        let owner = match &error {
            LifecycleError::NotOwner { owner, .. } => Some(owner.clone()),
            _ => None,
        };
        Self {
            status: status_for(&error),
            body: ErrorBody {
                error: error.to_string(),
                kind: error.kind().to_string(),
                retryable: error.is_retryable(),
                owner,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.lifecycle.refresh_health().await;
    let health = state.lifecycle.health.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.lifecycle.health.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.lifecycle.metrics.render(),
    )
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.lifecycle.node_stats())
}

async fn stat_by_name(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatValue> {
    let value = state.lifecycle.stats.get_by_name(&name)?;
    Ok(Json(StatValue { name, value }))
}

async fn score(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ScoreRequest>,
) -> Response {
    let detector_id = DetectorId::new(id);
    match state
        .lifecycle
        .manager
        .score(&detector_id, FeatureVector::new(request.features))
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn owner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<OwnerResponse> {
    let detector_id = DetectorId::new(id);
    let ring = state.lifecycle.manager.ring();
    let owner = ring.owner_of(&detector_id)?;
    Ok(Json(OwnerResponse {
        local: &owner == ring.local_node(),
        detector_id,
        owner,
        ring_version: ring.version(),
    }))
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StopResponse> {
    let detector_id = DetectorId::new(id);
    let was_resident = state.lifecycle.manager.stop_detector(&detector_id).await?;
    Ok(Json(StopResponse {
        detector_id,
        was_resident,
    }))
}

async fn put_detector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(config): Json<DetectorConfig>,
) -> Result<StatusCode, ApiError> {
    if config.detector_id.as_str() != id {
        return Err(ApiError::bad_request(format!(
            "path id {} does not match body id {}",
            id, config.detector_id
        )));
    }
    state.lifecycle.put_detector(config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_detector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    let detector_id = DetectorId::new(id);
    let existed = state.lifecycle.delete_detector(&detector_id).await?;
    Ok(Json(DeleteResponse {
        detector_id,
        existed,
    }))
}

/// Membership snapshot pushed by the cluster's consensus layer
async fn membership(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<MembershipSnapshot>,
) -> Response {
    match state
        .lifecycle
        .membership
        .apply(MembershipEvent::Snapshot(snapshot))
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.lifecycle.manager.resident_models())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/stats/:name", get(stat_by_name))
        .route("/models", get(models))
        .route("/detectors/:id", put(put_detector).delete(delete_detector))
        .route("/detectors/:id/score", post(score))
        .route("/detectors/:id/owner", get(owner))
        .route("/detectors/:id/stop", post(stop))
        .route("/cluster/membership", post(membership))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
