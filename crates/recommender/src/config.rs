//! Recommender configuration

use anyhow::{bail, Result};
use recommender_lib::checkpoint::CheckpointWriterConfig;
use recommender_lib::input::{FeederConfig, PrometheusHistoryConfig};
use recommender_lib::state::AggregationsConfig;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Where the usage model comes from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Restore from checkpoints.
    Checkpoint,
    /// Replay history from Prometheus.
    Prometheus,
}

/// Recommender configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecommenderConfig {
    /// Name used to pick the workloads this instance owns
    #[serde(default = "default_recommender_name")]
    pub recommender_name: String,

    #[serde(default = "default_recommender_interval")]
    pub recommender_interval_secs: u64,

    #[serde(default = "default_checkpoints_gc_interval")]
    pub checkpoints_gc_interval_secs: u64,

    #[serde(default = "default_checkpoints_write_interval")]
    pub checkpoints_write_interval_secs: u64,

    /// Minimum checkpoints written per run before the deadline may stop it
    #[serde(default = "default_min_checkpoints")]
    pub min_checkpoints: usize,

    #[serde(default = "default_storage")]
    pub storage: StorageMode,

    /// Directory for file checkpoints; checkpoints go to the cluster when unset
    #[serde(default)]
    pub checkpoint_dir: Option<String>,

    #[serde(default = "default_prometheus_address")]
    pub prometheus_address: String,

    #[serde(default = "default_cadvisor_job_name")]
    pub prometheus_cadvisor_job_name: String,

    #[serde(default = "default_history_length")]
    pub history_length: String,

    #[serde(default = "default_history_resolution")]
    pub history_resolution: String,

    #[serde(default = "default_query_timeout")]
    pub prometheus_query_timeout: String,

    #[serde(default = "default_pod_label_prefix")]
    pub pod_label_prefix: String,

    #[serde(default = "default_pod_labels_metric")]
    pub pod_labels_metric: String,

    #[serde(default = "default_pod_namespace_label")]
    pub pod_namespace_label: String,

    #[serde(default = "default_pod_name_label")]
    pub pod_name_label: String,

    #[serde(default = "default_container_namespace_label")]
    pub container_namespace_label: String,

    /// Defaults to `pod`, the cAdvisor label since Kubernetes 1.16; older
    /// clusters export `pod_name`
    #[serde(default = "default_container_pod_name_label")]
    pub container_pod_name_label: String,

    /// Defaults to `container`, the cAdvisor label since Kubernetes 1.16;
    /// older clusters export `name`
    #[serde(default = "default_container_name_label")]
    pub container_name_label: String,

    #[serde(default = "default_memory_aggregation_interval")]
    pub memory_aggregation_interval_secs: u64,

    #[serde(default = "default_memory_aggregation_interval_count")]
    pub memory_aggregation_interval_count: u32,

    #[serde(default = "default_half_life")]
    pub memory_histogram_decay_half_life_secs: u64,

    #[serde(default = "default_half_life")]
    pub cpu_histogram_decay_half_life_secs: u64,

    /// Only this namespace is watched; empty means all
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub cpu_integer_post_processor_enabled: bool,

    #[serde(default = "default_kube_api_qps")]
    pub kube_api_qps: f32,

    #[serde(default = "default_kube_api_burst")]
    pub kube_api_burst: u32,

    /// Timeout of a single call to the cluster or metrics API
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// Listen address of the health, metrics and recommendation API
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_recommender_name() -> String {
    recommender_lib::DEFAULT_RECOMMENDER_NAME.to_string()
}

fn default_recommender_interval() -> u64 {
    60
}

fn default_checkpoints_gc_interval() -> u64 {
    600
}

fn default_checkpoints_write_interval() -> u64 {
    60
}

fn default_min_checkpoints() -> usize {
    10
}

fn default_storage() -> StorageMode {
    StorageMode::Checkpoint
}

fn default_prometheus_address() -> String {
    "http://prometheus.monitoring.svc:9090".to_string()
}

fn default_cadvisor_job_name() -> String {
    "kubernetes-cadvisor".to_string()
}

fn default_history_length() -> String {
    "8d".to_string()
}

fn default_history_resolution() -> String {
    "1h".to_string()
}

fn default_query_timeout() -> String {
    "5m".to_string()
}

fn default_pod_label_prefix() -> String {
    "pod_label_".to_string()
}

fn default_pod_labels_metric() -> String {
    "up{job=\"kubernetes-pods\"}".to_string()
}

fn default_pod_namespace_label() -> String {
    "kubernetes_namespace".to_string()
}

fn default_pod_name_label() -> String {
    "kubernetes_pod_name".to_string()
}

fn default_container_namespace_label() -> String {
    "namespace".to_string()
}

fn default_container_pod_name_label() -> String {
    "pod".to_string()
}

fn default_container_name_label() -> String {
    "container".to_string()
}

fn default_memory_aggregation_interval() -> u64 {
    24 * 3600
}

fn default_memory_aggregation_interval_count() -> u32 {
    8
}

fn default_half_life() -> u64 {
    24 * 3600
}

fn default_kube_api_qps() -> f32 {
    5.0
}

fn default_kube_api_burst() -> u32 {
    10
}

fn default_api_timeout() -> u64 {
    30
}

fn default_address() -> String {
    "0.0.0.0:8942".to_string()
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            recommender_name: default_recommender_name(),
            recommender_interval_secs: default_recommender_interval(),
            checkpoints_gc_interval_secs: default_checkpoints_gc_interval(),
            checkpoints_write_interval_secs: default_checkpoints_write_interval(),
            min_checkpoints: default_min_checkpoints(),
            storage: default_storage(),
            checkpoint_dir: None,
            prometheus_address: default_prometheus_address(),
            prometheus_cadvisor_job_name: default_cadvisor_job_name(),
            history_length: default_history_length(),
            history_resolution: default_history_resolution(),
            prometheus_query_timeout: default_query_timeout(),
            pod_label_prefix: default_pod_label_prefix(),
            pod_labels_metric: default_pod_labels_metric(),
            pod_namespace_label: default_pod_namespace_label(),
            pod_name_label: default_pod_name_label(),
            container_namespace_label: default_container_namespace_label(),
            container_pod_name_label: default_container_pod_name_label(),
            container_name_label: default_container_name_label(),
            memory_aggregation_interval_secs: default_memory_aggregation_interval(),
            memory_aggregation_interval_count: default_memory_aggregation_interval_count(),
            memory_histogram_decay_half_life_secs: default_half_life(),
            cpu_histogram_decay_half_life_secs: default_half_life(),
            namespace: String::new(),
            cpu_integer_post_processor_enabled: false,
            kube_api_qps: default_kube_api_qps(),
            kube_api_burst: default_kube_api_burst(),
            api_timeout_secs: default_api_timeout(),
            address: default_address(),
        }
    }
}

impl RecommenderConfig {
    /// Load configuration from `VPA_*` environment variables and the
    /// optional file named by `VPA_CONFIG_FILE`
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("VPA_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("VPA"))
            .build()?;

        let loaded = config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid recommender configuration, using defaults");
            RecommenderConfig::default()
        });
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("recommender_interval_secs", self.recommender_interval_secs),
            ("checkpoints_write_interval_secs", self.checkpoints_write_interval_secs),
            ("checkpoints_gc_interval_secs", self.checkpoints_gc_interval_secs),
            ("memory_aggregation_interval_secs", self.memory_aggregation_interval_secs),
            ("memory_aggregation_interval_count", u64::from(self.memory_aggregation_interval_count)),
            ("memory_histogram_decay_half_life_secs", self.memory_histogram_decay_half_life_secs),
            ("cpu_histogram_decay_half_life_secs", self.cpu_histogram_decay_half_life_secs),
            ("api_timeout_secs", self.api_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be positive");
            }
        }
        if !(self.kube_api_qps.is_finite() && self.kube_api_qps > 0.0) {
            bail!("kube_api_qps must be positive, got {}", self.kube_api_qps);
        }
        for (name, value) in [
            ("history_length", &self.history_length),
            ("history_resolution", &self.history_resolution),
            ("prometheus_query_timeout", &self.prometheus_query_timeout),
        ] {
            if parse_duration(value).is_none() {
                bail!("{name} is not a duration: {value:?}");
            }
        }
        Ok(())
    }

    pub fn namespace_scope(&self) -> Option<String> {
        (!self.namespace.is_empty()).then(|| self.namespace.clone())
    }

    pub fn recommender_interval(&self) -> Duration {
        Duration::from_secs(self.recommender_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Liveness fails once no cycle finished for five intervals.
    pub fn liveness_threshold(&self) -> Duration {
        self.recommender_interval() * 5
    }

    pub fn aggregations(&self) -> AggregationsConfig {
        AggregationsConfig {
            memory_aggregation_interval: Duration::from_secs(self.memory_aggregation_interval_secs),
            memory_aggregation_interval_count: self.memory_aggregation_interval_count,
            memory_histogram_decay_half_life: Duration::from_secs(
                self.memory_histogram_decay_half_life_secs,
            ),
            cpu_histogram_decay_half_life: Duration::from_secs(
                self.cpu_histogram_decay_half_life_secs,
            ),
            ..Default::default()
        }
        .normalized()
    }

    pub fn feeder(&self) -> FeederConfig {
        FeederConfig {
            recommender_name: self.recommender_name.clone(),
            namespace: self.namespace_scope(),
            source_timeout: self.api_timeout(),
        }
    }

    /// A writing run may use up to half of the write interval.
    pub fn checkpoint_writer(&self) -> CheckpointWriterConfig {
        CheckpointWriterConfig {
            deadline: Duration::from_secs(self.checkpoints_write_interval_secs / 2),
            min_checkpoints: self.min_checkpoints,
        }
    }

    pub fn history(&self) -> Result<PrometheusHistoryConfig> {
        let address = Url::parse(&self.prometheus_address)?;
        let mut history = PrometheusHistoryConfig::new(address);
        history.query_timeout = parse_duration(&self.prometheus_query_timeout).unwrap_or(history.query_timeout);
        history.history_length = parse_duration(&self.history_length).unwrap_or(history.history_length);
        history.history_resolution =
            parse_duration(&self.history_resolution).unwrap_or(history.history_resolution);
        history.cadvisor_job_name = self.prometheus_cadvisor_job_name.clone();
        history.pod_labels_metric = self.pod_labels_metric.clone();
        history.pod_label_prefix = self.pod_label_prefix.clone();
        history.pod_namespace_label = self.pod_namespace_label.clone();
        history.pod_name_label = self.pod_name_label.clone();
        history.container_namespace_label = self.container_namespace_label.clone();
        history.container_pod_name_label = self.container_pod_name_label.clone();
        history.container_name_label = self.container_name_label.clone();
        history.namespace = self.namespace_scope();
        Ok(history)
    }
}

/// Parse `90s`, `5m`, `1h`, `8d` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, unit) = match s.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s, 's'),
    };
    let value: u64 = number.parse().ok()?;
    let secs = match unit {
        's' => Some(value),
        'm' => value.checked_mul(60),
        'h' => value.checked_mul(3600),
        'd' => value.checked_mul(24 * 3600),
        _ => None,
    }?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("8d"), Some(Duration::from_secs(8 * 24 * 3600)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_duration("1w"), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_parse_duration_overflow() {
        let huge = format!("{}d", u64::MAX / 10);
        assert_eq!(parse_duration(&huge), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX)), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)),
            Some(Duration::from_secs(u64::MAX))
        );

        let config = RecommenderConfig {
            history_length: huge,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_periods_rejected() {
        let zeroed: [fn(&mut RecommenderConfig); 7] = [
            |c| c.recommender_interval_secs = 0,
            |c| c.checkpoints_write_interval_secs = 0,
            |c| c.checkpoints_gc_interval_secs = 0,
            |c| c.memory_aggregation_interval_secs = 0,
            |c| c.memory_aggregation_interval_count = 0,
            |c| c.memory_histogram_decay_half_life_secs = 0,
            |c| c.cpu_histogram_decay_half_life_secs = 0,
        ];
        for zero in zeroed {
            let mut config = RecommenderConfig::default();
            zero(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_non_positive_qps_rejected() {
        for qps in [0.0, -1.0, f32::NAN] {
            let config = RecommenderConfig {
                kube_api_qps: qps,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_cadvisor_label_defaults() {
        let config = RecommenderConfig::default();
        assert_eq!(config.container_pod_name_label, "pod");
        assert_eq!(config.container_name_label, "container");
    }

    #[test]
    fn test_defaults() {
        let config = RecommenderConfig::default();
        assert_eq!(config.recommender_name, "default");
        assert_eq!(config.storage, StorageMode::Checkpoint);
        assert_eq!(config.liveness_threshold(), Duration::from_secs(300));
        assert_eq!(config.namespace_scope(), None);
        assert_eq!(config.feeder().source_timeout, Duration::from_secs(30));
        assert_eq!(config.checkpoint_writer().deadline, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_config_uses_label_mapping() {
        let config = RecommenderConfig {
            container_name_label: "container_name".to_string(),
            history_length: "2d".to_string(),
            namespace: "prod".to_string(),
            ..Default::default()
        };
        let history = config.history().unwrap();
        assert_eq!(history.container_name_label, "container_name");
        assert_eq!(history.history_length, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(history.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn test_aggregations_follow_config() {
        let config = RecommenderConfig {
            memory_aggregation_interval_count: 4,
            cpu_histogram_decay_half_life_secs: 3600,
            ..Default::default()
        };
        let aggregations = config.aggregations();
        assert_eq!(aggregations.memory_aggregation_interval_count, 4);
        assert_eq!(aggregations.cpu_histogram_decay_half_life, Duration::from_secs(3600));
    }
}
