//! API client for the recommender's HTTP API

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// API client for the recommender
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.get_with_status(path).await?;
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, body);
        }
        serde_json::from_str(&body).context("Failed to parse response")
    }

    /// GET a resource that reports failure through its status code but still
    /// carries a body, like `/healthz`
    pub async fn get_report<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let (status, body) = self.get_with_status(path).await?;
        let parsed = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response ({})", status))?;
        Ok((status, parsed))
    }

    async fn get_with_status(&self, path: &str) -> Result<(StatusCode, String)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

// API response types

/// Amounts keyed by resource name: millicores for `cpu`, bytes for `memory`
pub type Resources = BTreeMap<String, i64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecommendation {
    pub container_name: String,
    #[serde(default)]
    pub target: Resources,
    #[serde(default)]
    pub lower_bound: Resources,
    #[serde(default)]
    pub upper_bound: Resources,
    #[serde(default)]
    pub uncapped_target: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub containers: Vec<ContainerRecommendation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub condition_type: String,
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadRecommendation {
    pub namespace: String,
    pub name: String,
    pub pods: usize,
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl WorkloadRecommendation {
    pub fn condition(&self, condition_type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liveness {
    pub alive: bool,
    pub last_run_once: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub components: HashMap<String, ComponentHealth>,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub namespace: String,
    pub workload: String,
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_samples_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_recommendation_listing() {
        let body = r#"[{
            "namespace": "prod", "name": "api", "pods": 2,
            "recommendation": {"containers": [{
                "container_name": "app",
                "target": {"cpu": 120, "memory": 262144000},
                "lower_bound": {"cpu": 100}, "upper_bound": {"cpu": 400},
                "uncapped_target": {"cpu": 120}
            }]},
            "conditions": [{
                "condition_type": "LowConfidence", "status": true,
                "last_transition_time": "2024-03-01T10:00:00Z"
            }]
        }]"#;

        let workloads: Vec<WorkloadRecommendation> = serde_json::from_str(body).unwrap();
        assert_eq!(workloads.len(), 1);
        let api = &workloads[0];
        assert!(api.condition("LowConfidence"));
        assert!(!api.condition("NoPodsMatched"));
        let app = &api.recommendation.as_ref().unwrap().containers[0];
        assert_eq!(app.target["cpu"], 120);
    }

    #[tokio::test]
    async fn test_get_report_keeps_unavailable_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_body(
                r#"{"status":"healthy","components":{},
                    "liveness":{"alive":false,"last_run_once":null,"reason":"stalled"}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let (status, report): (_, HealthReport) = client.get_report("healthz").await.unwrap();

        mock.assert_async().await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!report.liveness.alive);
    }

    #[tokio::test]
    async fn test_get_fails_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/checkpoints")
            .with_status(503)
            .with_body("[]")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let result: Result<Vec<CheckpointSummary>> = client.get("api/v1/checkpoints").await;
        assert!(result.is_err());
    }
}
