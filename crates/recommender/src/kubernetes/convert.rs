//! Conversions between Kubernetes objects and engine models

use crate::quantity::{format_amount, parse_amount, parse_quantity};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::DynamicObject;
use recommender_lib::checkpoint::ContainerCheckpoint;
use recommender_lib::histogram::HistogramCheckpoint;
use recommender_lib::{
    AggregateKey, ConditionType, ContainerResourcePolicy, ContainerScalingMode, ContainerSpec,
    ContainerTermination, ContainerUsageSample, PodId, PodPhase, PodSpec, Recommendation,
    RecommendedContainerResources, ResourceName, ResourcePolicy, Resources, WorkloadCondition,
    WorkloadId, WorkloadSpec, WorkloadStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

fn resource_name(name: &str) -> Option<ResourceName> {
    match name {
        "cpu" => Some(ResourceName::Cpu),
        "memory" => Some(ResourceName::Memory),
        _ => None,
    }
}

fn quantity_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resources_from_json(map: &BTreeMap<String, Value>) -> Resources {
    map.iter()
        .filter_map(|(name, value)| {
            let resource = resource_name(name)?;
            let amount = parse_amount(resource, &quantity_text(value)?)?;
            Some((resource, amount))
        })
        .collect()
}

fn resources_from_quantities(map: Option<&BTreeMap<String, Quantity>>) -> Resources {
    map.into_iter()
        .flatten()
        .filter_map(|(name, quantity)| {
            let resource = resource_name(name)?;
            Some((resource, parse_amount(resource, &quantity.0)?))
        })
        .collect()
}

fn resources_to_strings(resources: &Resources) -> BTreeMap<String, String> {
    resources
        .iter()
        .map(|(resource, amount)| (resource.to_string(), format_amount(*resource, *amount)))
        .collect()
}

fn resources_from_strings(map: &BTreeMap<String, String>) -> Resources {
    map.iter()
        .filter_map(|(name, text)| {
            let resource = resource_name(name)?;
            Some((resource, parse_amount(resource, text)?))
        })
        .collect()
}

// VerticalPodAutoscaler spec

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaSpec {
    #[serde(default)]
    target_ref: Option<TargetRef>,
    #[serde(default)]
    recommenders: Vec<RecommenderRef>,
    #[serde(default)]
    resource_policy: Option<VpaResourcePolicy>,
}

/// Controller whose pods a workload covers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default)]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

impl TargetRef {
    /// Group and version of the target, `apps/v1` when unset.
    pub fn group_version(&self) -> (&str, &str) {
        let api_version = self.api_version.as_deref().unwrap_or("apps/v1");
        match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RecommenderRef {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaResourcePolicy {
    #[serde(default)]
    container_policies: Vec<VpaContainerPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaContainerPolicy {
    #[serde(default)]
    container_name: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    min_allowed: BTreeMap<String, Value>,
    #[serde(default)]
    max_allowed: BTreeMap<String, Value>,
    #[serde(default)]
    controlled_resources: Option<Vec<String>>,
}

impl From<VpaContainerPolicy> for ContainerResourcePolicy {
    fn from(policy: VpaContainerPolicy) -> Self {
        ContainerResourcePolicy {
            container_name: policy
                .container_name
                .unwrap_or_else(|| recommender_lib::WILDCARD_CONTAINER.to_string()),
            mode: match policy.mode.as_deref() {
                Some("Off") => ContainerScalingMode::Off,
                _ => ContainerScalingMode::Auto,
            },
            min_allowed: resources_from_json(&policy.min_allowed),
            max_allowed: resources_from_json(&policy.max_allowed),
            controlled_resources: policy
                .controlled_resources
                .map(|names| names.iter().filter_map(|n| resource_name(n)).collect()),
            max_limit_multiple: None,
        }
    }
}

/// Workload described by a VerticalPodAutoscaler object. The selector is
/// left empty; it comes from the target controller.
pub fn workload_from_object(object: &DynamicObject) -> Option<(WorkloadSpec, Option<TargetRef>)> {
    let namespace = object.metadata.namespace.clone()?;
    let name = object.metadata.name.clone()?;
    let spec: VpaSpec = match object.data.get("spec") {
        Some(spec) => serde_json::from_value(spec.clone()).ok()?,
        None => VpaSpec::default(),
    };

    let workload = WorkloadSpec {
        id: WorkloadId::new(namespace, name),
        selector: BTreeMap::new(),
        recommenders: spec.recommenders.into_iter().map(|r| r.name).collect(),
        resource_policy: ResourcePolicy {
            container_policies: spec
                .resource_policy
                .unwrap_or_default()
                .container_policies
                .into_iter()
                .map(ContainerResourcePolicy::from)
                .collect(),
        },
        annotations: object.metadata.annotations.clone().unwrap_or_default(),
    };
    Some((workload, spec.target_ref))
}

/// `spec.selector.matchLabels` of a controller object.
pub fn match_labels(data: &Value) -> BTreeMap<String, String> {
    data.pointer("/spec/selector/matchLabels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

// Pods

pub fn pod_from_object(pod: &Pod) -> Option<PodSpec> {
    let namespace = pod.metadata.namespace.clone()?;
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();

    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };

    let terminations: HashMap<&str, ContainerTermination> = status
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|cs| {
            let terminated = cs.last_state.as_ref()?.terminated.as_ref()?;
            Some((
                cs.name.as_str(),
                ContainerTermination {
                    reason: terminated.reason.clone().unwrap_or_default(),
                    finished_at: terminated.finished_at.as_ref()?.0,
                },
            ))
        })
        .collect();

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| {
                    let resources = c.resources.as_ref();
                    ContainerSpec {
                        name: c.name.clone(),
                        requests: resources_from_quantities(resources.and_then(|r| r.requests.as_ref())),
                        limits: resources_from_quantities(resources.and_then(|r| r.limits.as_ref())),
                        last_termination: terminations.get(c.name.as_str()).cloned(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Some(PodSpec {
        id: PodId::new(namespace, name),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        phase,
        containers,
    })
}

// metrics.k8s.io PodMetrics

#[derive(Debug, Deserialize)]
struct PodMetricsBody {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

/// Samples of one PodMetrics object, with the time they were taken.
pub fn usage_from_pod_metrics(
    object: &DynamicObject,
) -> Option<(PodId, DateTime<Utc>, Vec<ContainerUsageSample>)> {
    let pod = PodId::new(object.metadata.namespace.clone()?, object.metadata.name.clone()?);
    let body: PodMetricsBody = serde_json::from_value(object.data.clone()).ok()?;

    let samples = body
        .containers
        .iter()
        .flat_map(|container| {
            let pod = &pod;
            container.usage.iter().filter_map(move |(name, quantity)| {
                Some(ContainerUsageSample {
                    pod: pod.clone(),
                    container: container.name.clone(),
                    resource: resource_name(name)?,
                    usage: parse_quantity(quantity)?,
                    timestamp: body.timestamp,
                })
            })
        })
        .collect();
    Some((pod, body.timestamp, samples))
}

// VerticalPodAutoscaler status

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaStatus {
    /// Serialized as `null` when absent so a merge patch clears it.
    #[serde(default)]
    pub recommendation: Option<VpaRecommendation>,
    #[serde(default)]
    pub conditions: Vec<VpaCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaRecommendation {
    #[serde(default)]
    pub container_recommendations: Vec<VpaContainerRecommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaContainerRecommendation {
    pub container_name: String,
    #[serde(default)]
    pub target: BTreeMap<String, String>,
    #[serde(default)]
    pub lower_bound: BTreeMap<String, String>,
    #[serde(default)]
    pub upper_bound: BTreeMap<String, String>,
    #[serde(default)]
    pub uncapped_target: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

fn condition_name(condition_type: ConditionType) -> &'static str {
    match condition_type {
        ConditionType::RecommendationProvided => "RecommendationProvided",
        ConditionType::LowConfidence => "LowConfidence",
        ConditionType::NoPodsMatched => "NoPodsMatched",
    }
}

fn condition_type(name: &str) -> Option<ConditionType> {
    match name {
        "RecommendationProvided" => Some(ConditionType::RecommendationProvided),
        "LowConfidence" => Some(ConditionType::LowConfidence),
        "NoPodsMatched" => Some(ConditionType::NoPodsMatched),
        _ => None,
    }
}

impl From<&WorkloadStatus> for VpaStatus {
    fn from(status: &WorkloadStatus) -> Self {
        VpaStatus {
            recommendation: status.recommendation.as_ref().map(|r| VpaRecommendation {
                container_recommendations: r
                    .containers
                    .iter()
                    .map(|c| VpaContainerRecommendation {
                        container_name: c.container_name.clone(),
                        target: resources_to_strings(&c.target),
                        lower_bound: resources_to_strings(&c.lower_bound),
                        upper_bound: resources_to_strings(&c.upper_bound),
                        uncapped_target: resources_to_strings(&c.uncapped_target),
                    })
                    .collect(),
            }),
            conditions: status
                .conditions
                .iter()
                .map(|c| VpaCondition {
                    condition_type: condition_name(c.condition_type).to_string(),
                    status: if c.status { "True" } else { "False" }.to_string(),
                    message: c.message.clone(),
                    last_transition_time: Some(c.last_transition_time),
                })
                .collect(),
        }
    }
}

impl From<VpaStatus> for WorkloadStatus {
    fn from(status: VpaStatus) -> Self {
        WorkloadStatus {
            recommendation: status.recommendation.map(|r| Recommendation {
                containers: r
                    .container_recommendations
                    .iter()
                    .map(|c| RecommendedContainerResources {
                        container_name: c.container_name.clone(),
                        target: resources_from_strings(&c.target),
                        lower_bound: resources_from_strings(&c.lower_bound),
                        upper_bound: resources_from_strings(&c.upper_bound),
                        uncapped_target: resources_from_strings(&c.uncapped_target),
                    })
                    .collect(),
            }),
            conditions: status
                .conditions
                .into_iter()
                .filter_map(|c| {
                    Some(WorkloadCondition {
                        condition_type: condition_type(&c.condition_type)?,
                        status: c.status == "True",
                        message: c.message,
                        last_transition_time: c.last_transition_time.unwrap_or_default(),
                    })
                })
                .collect(),
        }
    }
}

/// Status of a VerticalPodAutoscaler object; empty when missing or unreadable.
pub fn workload_status(data: &Value) -> WorkloadStatus {
    data.get("status")
        .and_then(|status| serde_json::from_value::<VpaStatus>(status.clone()).ok())
        .map(WorkloadStatus::from)
        .unwrap_or_default()
}

// VerticalPodAutoscalerCheckpoint

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSpec {
    pub vpa_object_name: String,
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistogramStatus {
    #[serde(default)]
    reference_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    bucket_weights: BTreeMap<u32, f64>,
    #[serde(default)]
    total_weight: f64,
}

impl From<&HistogramCheckpoint> for HistogramStatus {
    fn from(h: &HistogramCheckpoint) -> Self {
        HistogramStatus {
            reference_timestamp: h.reference_timestamp,
            bucket_weights: h.bucket_weights.clone(),
            total_weight: h.total_weight,
        }
    }
}

impl From<HistogramStatus> for HistogramCheckpoint {
    fn from(h: HistogramStatus) -> Self {
        HistogramCheckpoint {
            reference_timestamp: h.reference_timestamp,
            bucket_weights: h.bucket_weights,
            total_weight: h.total_weight,
        }
    }
}

/// Checkpoint status in the VerticalPodAutoscalerCheckpoint layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    version: String,
    last_update_time: DateTime<Utc>,
    cpu_histogram: HistogramStatus,
    memory_histogram: HistogramStatus,
    #[serde(default)]
    first_sample_start: Option<DateTime<Utc>>,
    #[serde(default)]
    last_sample_start: Option<DateTime<Utc>>,
    #[serde(default)]
    total_samples_count: u64,
}

impl From<&ContainerCheckpoint> for CheckpointStatus {
    fn from(c: &ContainerCheckpoint) -> Self {
        CheckpointStatus {
            version: c.version.clone(),
            last_update_time: c.last_update_time,
            cpu_histogram: (&c.cpu_histogram).into(),
            memory_histogram: (&c.memory_histogram).into(),
            first_sample_start: c.first_sample_start,
            last_sample_start: c.last_sample_start,
            total_samples_count: c.total_samples_count,
        }
    }
}

impl From<CheckpointStatus> for ContainerCheckpoint {
    fn from(c: CheckpointStatus) -> Self {
        ContainerCheckpoint {
            version: c.version,
            last_update_time: c.last_update_time,
            cpu_histogram: c.cpu_histogram.into(),
            memory_histogram: c.memory_histogram.into(),
            first_sample_start: c.first_sample_start,
            last_sample_start: c.last_sample_start,
            total_samples_count: c.total_samples_count,
        }
    }
}

pub fn checkpoint_object_name(key: &AggregateKey) -> String {
    format!("{}-{}", key.workload.name, key.container)
}

/// Key of a checkpoint object, from its namespace and spec.
pub fn checkpoint_key(object: &DynamicObject) -> Option<AggregateKey> {
    let namespace = object.metadata.namespace.clone()?;
    let spec: CheckpointSpec = serde_json::from_value(object.data.get("spec")?.clone()).ok()?;
    Some(AggregateKey::new(
        WorkloadId::new(namespace, spec.vpa_object_name),
        spec.container_name,
    ))
}
