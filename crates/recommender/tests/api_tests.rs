//! Integration tests for the recommender API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use recommender_lib::{
    checkpoint::{CheckpointStore, ContainerCheckpoint, MemoryCheckpointStore, CHECKPOINT_VERSION},
    health::{components, HealthRegistry},
    histogram::HistogramCheckpoint,
    state::{AggregationsConfig, ClusterState},
    AggregateKey, RecommenderMetrics, WorkloadId, WorkloadSpec,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower::ServiceExt;
use vpa_recommender::api::{create_router, AppState};

fn workload(namespace: &str, name: &str) -> WorkloadSpec {
    WorkloadSpec {
        id: WorkloadId::new(namespace, name),
        selector: [("app".to_string(), name.to_string())].into(),
        recommenders: vec![],
        resource_policy: Default::default(),
        annotations: BTreeMap::new(),
    }
}

fn empty_histogram() -> HistogramCheckpoint {
    HistogramCheckpoint {
        reference_timestamp: None,
        bucket_weights: BTreeMap::new(),
        total_weight: 0.0,
    }
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::FEEDER).await;
    health_registry.register(components::RECOMMENDER).await;

    let cluster = Arc::new(RwLock::new(ClusterState::new(Arc::new(
        AggregationsConfig::default(),
    ))));
    {
        let mut cluster = cluster.write().await;
        cluster.add_or_update_workload(workload("prod", "api"), Utc::now());
        cluster.add_or_update_workload(workload("prod", "worker"), Utc::now());
        cluster.add_or_update_workload(workload("staging", "api"), Utc::now());
    }

    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .save(
            &AggregateKey::new(WorkloadId::new("prod", "api"), "app"),
            &ContainerCheckpoint {
                version: CHECKPOINT_VERSION.to_string(),
                last_update_time: Utc::now(),
                cpu_histogram: empty_histogram(),
                memory_histogram: empty_histogram(),
                first_sample_start: None,
                last_sample_start: None,
                total_samples_count: 42,
            },
        )
        .await
        .unwrap();

    let state = Arc::new(AppState::new(health_registry, cluster, store));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["liveness"]["alive"], true);
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::FEEDER, "Pod listing failed")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::RECOMMENDER, "Cycle failed")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_healthz_returns_503_when_cycles_stall() {
    let registry = HealthRegistry::new()
        .with_liveness_threshold(Duration::from_secs(300))
        .with_started_at(Utc::now() - ChronoDuration::hours(1));
    registry.register(components::RECOMMENDER).await;
    registry
        .record_run_once(Utc::now() - ChronoDuration::minutes(10))
        .await;

    let cluster = Arc::new(RwLock::new(ClusterState::new(Arc::new(
        AggregationsConfig::default(),
    ))));
    let state = Arc::new(AppState::new(
        registry,
        cluster,
        Arc::new(MemoryCheckpointStore::new()),
    ));

    let (status, health) = get_json(create_router(state), "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["liveness"]["alive"], false);
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    // Not ready until initialization finished
    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let metrics = RecommenderMetrics::new();
    metrics.observe_run_once(0.25, Utc::now().timestamp());
    metrics.set_model_size(3, 0);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("vpa_recommender_run_once_duration_seconds_bucket"));
    assert!(metrics_text.contains("vpa_recommender_tracked_workloads"));
}

#[tokio::test]
async fn test_recommendations_lists_every_workload() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/recommendations").await;

    assert_eq!(status, StatusCode::OK);
    let workloads = body.as_array().unwrap();
    assert_eq!(workloads.len(), 3);
    assert_eq!(workloads[0]["namespace"], "prod");
    assert_eq!(workloads[0]["name"], "api");
    assert!(workloads[0]["recommendation"].is_null());
}

#[tokio::test]
async fn test_recommendations_filtered_by_namespace() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/recommendations/staging").await;

    assert_eq!(status, StatusCode::OK);
    let workloads = body.as_array().unwrap();
    assert_eq!(workloads.len(), 1);
    assert_eq!(workloads[0]["name"], "api");
}

#[tokio::test]
async fn test_checkpoints_lists_stored_checkpoints() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/checkpoints").await;

    assert_eq!(status, StatusCode::OK);
    let checkpoints = body.as_array().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0]["workload"], "api");
    assert_eq!(checkpoints[0]["container"], "app");
    assert_eq!(checkpoints[0]["total_samples_count"], 42);
    assert!(checkpoints[0].get("error").is_none());
}
