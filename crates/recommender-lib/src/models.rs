//! Core data models for the recommender
//!
//! Identities, resource quantities, observed orchestrator objects and the
//! recommendation/status shapes surfaced to the updater.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Recommender name used when a workload does not name one.
pub const DEFAULT_RECOMMENDER_NAME: &str = "default";

/// Resources the engine recommends for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar resource quantity: millicores for CPU, bytes for memory.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceAmount(pub i64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    /// Rounds up to the next whole millicore.
    pub fn from_cores(cores: f64) -> Self {
        Self::saturating((cores * 1000.0).ceil())
    }

    /// Rounds up to the next whole byte.
    pub fn from_bytes(bytes: f64) -> Self {
        Self::saturating(bytes.ceil())
    }

    /// Convert a raw histogram value of `resource` into an amount.
    pub fn from_usage(resource: ResourceName, value: f64) -> Self {
        match resource {
            ResourceName::Cpu => Self::from_cores(value),
            ResourceName::Memory => Self::from_bytes(value),
        }
    }

    /// The amount in the unit histograms use: cores for CPU, bytes for memory.
    pub fn to_usage(self, resource: ResourceName) -> f64 {
        match resource {
            ResourceName::Cpu => self.0 as f64 / 1000.0,
            ResourceName::Memory => self.0 as f64,
        }
    }

    pub fn scale(self, factor: f64) -> Self {
        Self::saturating((self.0 as f64 * factor).round())
    }

    fn saturating(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            ResourceAmount(0)
        } else if value >= i64::MAX as f64 {
            ResourceAmount(i64::MAX)
        } else {
            ResourceAmount(value as i64)
        }
    }
}

/// Amounts keyed by resource.
pub type Resources = BTreeMap<ResourceName, ResourceAmount>;

/// Identity of a workload (one recommendation target).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a pod.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of one aggregate container state and of its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub workload: WorkloadId,
    pub container: String,
}

impl AggregateKey {
    pub fn new(workload: WorkloadId, container: impl Into<String>) -> Self {
        Self {
            workload,
            container: container.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workload, self.container)
    }
}

/// Whether a container receives recommendations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerScalingMode {
    #[default]
    Auto,
    Off,
}

/// Container name matching every container in a policy.
pub const WILDCARD_CONTAINER: &str = "*";

/// Bounds and switches for one container (or all, via `*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default)]
    pub mode: ContainerScalingMode,
    #[serde(default)]
    pub min_allowed: Resources,
    #[serde(default)]
    pub max_allowed: Resources,
    /// Resources to recommend for; all when unset.
    #[serde(default)]
    pub controlled_resources: Option<Vec<ResourceName>>,
    /// Cap recommendations at this multiple of the container's current limit.
    #[serde(default)]
    pub max_limit_multiple: Option<f64>,
}

impl ContainerResourcePolicy {
    pub fn controls(&self, resource: ResourceName) -> bool {
        self.controlled_resources
            .as_ref()
            .map(|resources| resources.contains(&resource))
            .unwrap_or(true)
    }
}

/// Per-workload resource policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

impl ResourcePolicy {
    /// Policy for `container`, preferring an exact name over the wildcard.
    pub fn for_container(&self, container: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == container)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == WILDCARD_CONTAINER)
            })
    }

    pub fn mode_for(&self, container: &str) -> ContainerScalingMode {
        self.for_container(container)
            .map(|p| p.mode)
            .unwrap_or_default()
    }
}

/// A workload object as observed from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: WorkloadId,
    /// Pods whose labels contain all of these belong to the workload.
    pub selector: BTreeMap<String, String>,
    /// Recommender instances asked to handle this workload.
    #[serde(default)]
    pub recommenders: Vec<String>,
    #[serde(default)]
    pub resource_policy: ResourcePolicy,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Whether the recommender instance named `name` owns this workload.
    pub fn is_handled_by(&self, name: &str) -> bool {
        if self.recommenders.is_empty() {
            name == DEFAULT_RECOMMENDER_NAME
        } else {
            self.recommenders.iter().any(|r| r == name)
        }
    }

    pub fn matches(&self, pod: &PodSpec) -> bool {
        pod.id.namespace == self.id.namespace
            && !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(key, value)| pod.labels.get(key) == Some(value))
    }
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Reason reported for containers killed by the kernel OOM killer.
pub const OOM_KILLED_REASON: &str = "OOMKilled";

/// Last termination of a container, as reported in pod status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerTermination {
    pub reason: String,
    pub finished_at: DateTime<Utc>,
}

/// A container of an observed pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub requests: Resources,
    #[serde(default)]
    pub limits: Resources,
    #[serde(default)]
    pub last_termination: Option<ContainerTermination>,
}

/// A pod object as observed from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PodId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// One usage observation for one container.
///
/// CPU usage is in cores, memory usage in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSample {
    pub pod: PodId,
    pub container: String,
    pub resource: ResourceName,
    pub usage: f64,
    pub timestamp: DateTime<Utc>,
}

/// Recommended resources for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedContainerResources {
    pub container_name: String,
    pub target: Resources,
    pub lower_bound: Resources,
    pub upper_bound: Resources,
    pub uncapped_target: Resources,
}

/// Recommendation for every container of a workload that has enough data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub containers: Vec<RecommendedContainerResources>,
}

impl Recommendation {
    pub fn container(&self, name: &str) -> Option<&RecommendedContainerResources> {
        self.containers.iter().find(|c| c.container_name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Status conditions written next to a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    RecommendationProvided,
    LowConfidence,
    NoPodsMatched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadCondition {
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// What the engine publishes for a workload.
///
/// `recommendation` is `None` until at least one container has data, which
/// is distinct from a recommendation of zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub conditions: Vec<WorkloadCondition>,
}

impl WorkloadStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&WorkloadCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Same recommendation and condition states, ignoring transition times.
    pub fn is_equivalent(&self, other: &WorkloadStatus) -> bool {
        if self.recommendation != other.recommendation
            || self.conditions.len() != other.conditions.len()
        {
            return false;
        }
        self.conditions.iter().all(|c| {
            other
                .condition(c.condition_type)
                .map(|o| o.status == c.status && o.message == c.message)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(labels: &[(&str, &str)]) -> PodSpec {
        PodSpec {
            id: PodId::new("default", "web-1"),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            phase: PodPhase::Running,
            containers: vec![],
        }
    }

    fn workload(selector: &[(&str, &str)]) -> WorkloadSpec {
        WorkloadSpec {
            id: WorkloadId::new("default", "web"),
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            recommenders: vec![],
            resource_policy: ResourcePolicy::default(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_resource_amount_conversions() {
        assert_eq!(ResourceAmount::from_cores(0.1), ResourceAmount(100));
        assert_eq!(ResourceAmount::from_cores(0.0101), ResourceAmount(11));
        assert_eq!(ResourceAmount::from_bytes(1024.2), ResourceAmount(1025));
        assert_eq!(ResourceAmount::from_cores(-1.0), ResourceAmount::ZERO);
        assert_eq!(ResourceAmount(1500).to_usage(ResourceName::Cpu), 1.5);
        assert_eq!(ResourceAmount(100).scale(1.15), ResourceAmount(115));
    }

    #[test]
    fn test_selector_matching() {
        let spec = workload(&[("app", "web")]);
        assert!(spec.matches(&pod(&[("app", "web"), ("tier", "frontend")])));
        assert!(!spec.matches(&pod(&[("app", "api")])));
        assert!(!workload(&[]).matches(&pod(&[("app", "web")])));
    }

    #[test]
    fn test_recommender_partitioning() {
        let mut spec = workload(&[("app", "web")]);
        assert!(spec.is_handled_by(DEFAULT_RECOMMENDER_NAME));
        assert!(!spec.is_handled_by("custom"));

        spec.recommenders = vec!["custom".to_string()];
        assert!(spec.is_handled_by("custom"));
        assert!(!spec.is_handled_by(DEFAULT_RECOMMENDER_NAME));
    }

    #[test]
    fn test_policy_prefers_exact_container_name() {
        let policy = ResourcePolicy {
            container_policies: vec![
                ContainerResourcePolicy {
                    container_name: WILDCARD_CONTAINER.to_string(),
                    mode: ContainerScalingMode::Off,
                    ..Default::default()
                },
                ContainerResourcePolicy {
                    container_name: "app".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(policy.mode_for("app"), ContainerScalingMode::Auto);
        assert_eq!(policy.mode_for("sidecar"), ContainerScalingMode::Off);
    }

    #[test]
    fn test_resources_serialize_with_resource_keys() {
        let mut resources = Resources::new();
        resources.insert(ResourceName::Cpu, ResourceAmount(250));
        let json = serde_json::to_string(&resources).unwrap();
        assert_eq!(json, r#"{"cpu":250}"#);
    }
}
