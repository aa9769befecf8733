//! Component health, readiness and liveness for the recommender's probes
//!
//! Liveness is tied to the last successful reconciliation cycle rather than
//! to process uptime, so a wedged loop eventually fails its probe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Ordered from best to worst; the overall status is the worst component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn observed(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub last_run_once: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const FEEDER: &str = "feeder";
    pub const RECOMMENDER: &str = "recommender";
    pub const CHECKPOINT_WRITER: &str = "checkpoint_writer";
    pub const CHECKPOINT_GC: &str = "checkpoint_gc";
}

/// Five default reconciliation intervals
pub const DEFAULT_LIVENESS_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct ProbeState {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
    last_run_once: Option<DateTime<Utc>>,
}

/// Shared probe state, cloned into every routine that reports health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<ProbeState>>,
    started_at: DateTime<Utc>,
    liveness_threshold: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ProbeState::default())),
            started_at: Utc::now(),
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
        }
    }

    /// Consider the process dead once no cycle succeeded for `threshold`
    pub fn with_liveness_threshold(mut self, threshold: Duration) -> Self {
        self.liveness_threshold = threshold;
        self
    }

    /// Reference point for liveness until the first cycle completes
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::observed(status, message));
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Record a successful reconciliation cycle
    pub async fn record_run_once(&self, at: DateTime<Utc>) {
        self.state.write().await.last_run_once = Some(at);
    }

    pub async fn last_run_once(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_run_once
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    /// Ready once initialized, and only while no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.state.read().await.ready;
        let reason = if !ready {
            Some("Recommender not yet initialized")
        } else if self.health().await.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }

    /// Liveness as of `now`
    pub async fn liveness(&self, now: DateTime<Utc>) -> LivenessResponse {
        let last_run_once = self.last_run_once().await;
        let since = now - last_run_once.unwrap_or(self.started_at);
        let threshold = chrono::Duration::from_std(self.liveness_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let alive = since <= threshold;

        LivenessResponse {
            alive,
            last_run_once,
            reason: (!alive).then(|| {
                format!(
                    "No successful recommendation cycle for {}s",
                    since.num_seconds()
                )
            }),
        }
    }
}
