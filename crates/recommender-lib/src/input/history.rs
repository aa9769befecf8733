//! Usage history from a Prometheus-compatible time-series database

use super::source::{ClusterHistory, HistoryProvider};
use crate::models::{ContainerUsageSample, PodId, ResourceName};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Query parameters and label mappings for the history source.
#[derive(Debug, Clone)]
pub struct PrometheusHistoryConfig {
    pub address: Url,
    pub query_timeout: Duration,
    /// How far back to look.
    pub history_length: Duration,
    /// Step between returned points.
    pub history_resolution: Duration,
    pub cadvisor_job_name: String,
    /// Metric whose labels carry pod labels.
    pub pod_labels_metric: String,
    /// Prefix of pod label names on `pod_labels_metric`.
    pub pod_label_prefix: String,
    pub pod_namespace_label: String,
    pub pod_name_label: String,
    pub container_namespace_label: String,
    /// cAdvisor pod label, `pod` since Kubernetes 1.16 (formerly `pod_name`).
    pub container_pod_name_label: String,
    /// cAdvisor container label, `container` since Kubernetes 1.16 (formerly `name`).
    pub container_name_label: String,
    /// Restrict queries to one namespace.
    pub namespace: Option<String>,
}

impl PrometheusHistoryConfig {
    pub fn new(address: Url) -> Self {
        Self {
            address,
            query_timeout: Duration::from_secs(5 * 60),
            history_length: Duration::from_secs(8 * 24 * 3600),
            history_resolution: Duration::from_secs(3600),
            cadvisor_job_name: "kubernetes-cadvisor".to_string(),
            pod_labels_metric: "up{job=\"kubernetes-pods\"}".to_string(),
            pod_label_prefix: "pod_label_".to_string(),
            pod_namespace_label: "kubernetes_namespace".to_string(),
            pod_name_label: "kubernetes_pod_name".to_string(),
            container_namespace_label: "namespace".to_string(),
            container_pod_name_label: "pod".to_string(),
            container_name_label: "container".to_string(),
            namespace: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Reads container usage and pod labels with range queries.
pub struct PrometheusHistoryProvider {
    client: Client,
    config: PrometheusHistoryConfig,
}

impl PrometheusHistoryProvider {
    pub fn new(config: PrometheusHistoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.query_timeout)
            .build()
            .context("Failed to create history HTTP client")?;
        Ok(Self { client, config })
    }

    fn container_selector(&self) -> String {
        let mut matchers = vec![
            format!("job=\"{}\"", self.config.cadvisor_job_name),
            format!("{}=~\".+\"", self.config.container_pod_name_label),
            format!("{}!=\"POD\"", self.config.container_name_label),
            format!("{}!=\"\"", self.config.container_name_label),
        ];
        if let Some(namespace) = &self.config.namespace {
            matchers.push(format!(
                "{}=\"{}\"",
                self.config.container_namespace_label, namespace
            ));
        }
        matchers.join(", ")
    }

    fn cpu_query(&self) -> String {
        format!(
            "rate(container_cpu_usage_seconds_total{{{}}}[{}s])",
            self.container_selector(),
            self.config.history_resolution.as_secs()
        )
    }

    fn memory_query(&self) -> String {
        format!(
            "container_memory_working_set_bytes{{{}}}",
            self.container_selector()
        )
    }

    fn labels_query(&self) -> String {
        format!(
            "{}[{}s]",
            self.config.pod_labels_metric,
            self.config.history_length.as_secs()
        )
    }

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Series>> {
        let url = self
            .config
            .address
            .join("api/v1/query_range")
            .context("Invalid history address")?;
        let step = format!("{}s", self.config.history_resolution.as_secs().max(1));
        let params = [
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", step),
        ];
        self.fetch(url, &params).await
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>> {
        let url = self
            .config
            .address
            .join("api/v1/query")
            .context("Invalid history address")?;
        let params = [
            ("query", query.to_string()),
            ("time", at.timestamp().to_string()),
        ];
        self.fetch(url, &params).await
    }

    async fn fetch(&self, url: Url, params: &[(&str, String)]) -> Result<Vec<Series>> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .context("Failed to send history query")?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse history response ({status})"))?;
        if body.status != "success" {
            bail!(
                "History query failed ({}): {}",
                status,
                body.error.unwrap_or_default()
            );
        }
        let data = body.data.context("History response has no data")?;
        if data.result_type != "matrix" {
            bail!("Unexpected history result type {}", data.result_type);
        }
        Ok(data.result)
    }

    fn add_usage(
        &self,
        history: &mut ClusterHistory,
        series: Vec<Series>,
        resource: ResourceName,
    ) -> usize {
        let mut added = 0;
        for s in series {
            let (Some(namespace), Some(pod), Some(container)) = (
                s.metric.get(&self.config.container_namespace_label),
                s.metric.get(&self.config.container_pod_name_label),
                s.metric.get(&self.config.container_name_label),
            ) else {
                debug!(metric = ?s.metric, "History series without pod identity skipped");
                continue;
            };
            let pod_id = PodId::new(namespace.clone(), pod.clone());
            let samples = history
                .pods
                .entry(pod_id.clone())
                .or_default()
                .samples
                .entry(container.clone())
                .or_default();

            for (timestamp, value) in s.values {
                let (Some(timestamp), Ok(usage)) = (to_timestamp(timestamp), value.parse::<f64>())
                else {
                    continue;
                };
                if !usage.is_finite() || usage < 0.0 {
                    continue;
                }
                samples.push(ContainerUsageSample {
                    pod: pod_id.clone(),
                    container: container.clone(),
                    resource,
                    usage,
                    timestamp,
                });
                added += 1;
            }
        }
        added
    }

    fn add_labels(&self, history: &mut ClusterHistory, series: Vec<Series>) {
        for s in series {
            let (Some(namespace), Some(pod)) = (
                s.metric.get(&self.config.pod_namespace_label),
                s.metric.get(&self.config.pod_name_label),
            ) else {
                continue;
            };
            let Some(pod_history) = history
                .pods
                .get_mut(&PodId::new(namespace.clone(), pod.clone()))
            else {
                continue;
            };
            for (key, value) in &s.metric {
                if let Some(label) = key.strip_prefix(&self.config.pod_label_prefix) {
                    pod_history.labels.insert(label.to_string(), value.clone());
                }
            }
        }
    }
}

fn to_timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64)
        .single()
}

#[async_trait]
impl HistoryProvider for PrometheusHistoryProvider {
    async fn cluster_history(&self) -> Result<ClusterHistory> {
        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(self.config.history_length)
                .context("History length out of range")?;

        let cpu = self
            .query_range(&self.cpu_query(), start, end)
            .await
            .context("Failed to query CPU history")?;
        let memory = self
            .query_range(&self.memory_query(), start, end)
            .await
            .context("Failed to query memory history")?;
        let labels = self
            .query(&self.labels_query(), end)
            .await
            .context("Failed to query pod labels")?;

        let mut history = ClusterHistory::default();
        let cpu_samples = self.add_usage(&mut history, cpu, ResourceName::Cpu);
        let memory_samples = self.add_usage(&mut history, memory, ResourceName::Memory);
        self.add_labels(&mut history, labels);

        info!(
            pods = history.pods.len(),
            cpu_samples = cpu_samples,
            memory_samples = memory_samples,
            "Loaded usage history"
        );
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn matrix(series: serde_json::Value) -> String {
        serde_json::json!({
            "status": "success",
            "data": { "resultType": "matrix", "result": series }
        })
        .to_string()
    }

    fn provider(server: &mockito::Server) -> PrometheusHistoryProvider {
        let address = Url::parse(&format!("{}/", server.url())).unwrap();
        PrometheusHistoryProvider::new(PrometheusHistoryConfig::new(address)).unwrap()
    }

    #[tokio::test]
    async fn test_cluster_history_correlates_series() {
        let mut server = mockito::Server::new_async().await;
        let cpu = server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Regex("container_cpu_usage_seconds_total".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(matrix(serde_json::json!([{
                "metric": {"namespace": "prod", "pod": "web-1", "container": "app"},
                "values": [[1704067200, "0.25"], [1704070800, "0.5"]]
            }])))
            .create_async()
            .await;
        let memory = server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Regex("container_memory_working_set_bytes".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(matrix(serde_json::json!([{
                "metric": {"namespace": "prod", "pod": "web-1", "container": "app"},
                "values": [[1704067200, "104857600"], [1704070800, "NaN"]]
            }, {
                "metric": {"namespace": "prod"},
                "values": [[1704067200, "1"]]
            }])))
            .create_async()
            .await;
        let labels = server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(matrix(serde_json::json!([{
                "metric": {
                    "kubernetes_namespace": "prod",
                    "kubernetes_pod_name": "web-1",
                    "pod_label_app": "web"
                },
                "values": [[1704070800, "1"]]
            }])))
            .create_async()
            .await;

        let history = provider(&server).cluster_history().await.unwrap();
        cpu.assert_async().await;
        memory.assert_async().await;
        labels.assert_async().await;

        let pod = &history.pods[&PodId::new("prod", "web-1")];
        assert_eq!(pod.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(pod.sample_count(), 3);
        assert_eq!(history.samples_in_order().len(), 3);
        let first = history.samples_in_order()[0];
        assert_eq!(first.timestamp, Utc.timestamp_opt(1704067200, 0).unwrap());
    }

    #[tokio::test]
    async fn test_query_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
            .create_async()
            .await;

        let err = provider(&server).cluster_history().await.unwrap_err();
        assert!(format!("{err:#}").contains("parse error"));
    }

    #[test]
    fn test_queries_respect_namespace_and_labels() {
        let mut config = PrometheusHistoryConfig::new(Url::parse("http://prom:9090/").unwrap());
        config.namespace = Some("prod".to_string());
        config.container_name_label = "container_name".to_string();
        let provider = PrometheusHistoryProvider::new(config).unwrap();

        let query = provider.cpu_query();
        assert!(query.starts_with("rate(container_cpu_usage_seconds_total{"));
        assert!(query.contains("namespace=\"prod\""));
        assert!(query.contains("container_name!=\"POD\""));
        assert!(query.ends_with("[3600s])"));
        assert_eq!(provider.labels_query(), "up{job=\"kubernetes-pods\"}[691200s]");
    }
}
