//! HTTP API for health checks, Prometheus metrics and read-only views of
//! the recommender's state

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use recommender_lib::{
    checkpoint::CheckpointStore,
    health::{ComponentStatus, HealthRegistry, HealthResponse, LivenessResponse},
    state::ClusterState,
    Recommendation, WorkloadCondition,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub cluster: Arc<RwLock<ClusterState>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        cluster: Arc<RwLock<ClusterState>>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            health_registry,
            cluster,
            checkpoints,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthzResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub liveness: LivenessResponse,
}

/// Latest recommendation of one workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadRecommendation {
    pub namespace: String,
    pub name: String,
    pub pods: usize,
    pub recommendation: Option<Recommendation>,
    pub conditions: Vec<WorkloadCondition>,
}

/// One stored checkpoint, or why it could not be read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub namespace: String,
    pub workload: String,
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_samples_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check response - 503 when a component failed or no cycle
/// finished recently
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let liveness = state.health_registry.liveness(Utc::now()).await;

    let status_code = match health.status {
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ if !liveness.alive => StatusCode::SERVICE_UNAVAILABLE,
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
    };

    (status_code, Json(HealthzResponse { health, liveness }))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn recommendations_in(state: &AppState, namespace: Option<&str>) -> Vec<WorkloadRecommendation> {
    let cluster = state.cluster.read().await;
    let mut views: Vec<WorkloadRecommendation> = cluster
        .workloads()
        .filter(|w| namespace.map_or(true, |ns| w.id().namespace == ns))
        .map(|w| WorkloadRecommendation {
            namespace: w.id().namespace.clone(),
            name: w.id().name.clone(),
            pods: w.pods.len(),
            recommendation: w.status.recommendation.clone(),
            conditions: w.status.conditions.clone(),
        })
        .collect();
    views.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    views
}

async fn recommendations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(recommendations_in(&state, None).await)
}

async fn namespace_recommendations(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    Json(recommendations_in(&state, Some(&namespace)).await)
}

async fn checkpoints(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let keys = match state.checkpoints.list().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "Failed to list checkpoints");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Vec::<CheckpointSummary>::new()),
            );
        }
    };

    let mut summaries = Vec::with_capacity(keys.len());
    for key in keys {
        let loaded = state.checkpoints.load(&key).await;
        let (last_update_time, total_samples_count, error) = match loaded {
            Ok(c) => (Some(c.last_update_time), Some(c.total_samples_count), None),
            Err(e) => (None, None, Some(e.to_string())),
        };
        summaries.push(CheckpointSummary {
            namespace: key.workload.namespace,
            workload: key.workload.name,
            container: key.container,
            last_update_time,
            total_samples_count,
            error,
        });
    }
    (StatusCode::OK, Json(summaries))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/recommendations", get(recommendations))
        .route("/api/v1/recommendations/:namespace", get(namespace_recommendations))
        .route("/api/v1/checkpoints", get(checkpoints))
        .with_state(state)
}

/// Start the API server
pub async fn serve(addr: String, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
