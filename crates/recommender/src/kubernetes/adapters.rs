use super::convert::{
    checkpoint_key, checkpoint_object_name, match_labels, pod_from_object,
    usage_from_pod_metrics, workload_from_object, workload_status, CheckpointSpec,
    CheckpointStatus, TargetRef, VpaStatus,
};
use super::{
    api_error_code, checkpoint_resource, pod_metrics_resource, vpa_resource, KubeContext,
    FIELD_MANAGER,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use recommender_lib::checkpoint::{CheckpointStore, ContainerCheckpoint};
use recommender_lib::input::{ClusterSource, MetricsSource};
use recommender_lib::routines::{StatusSink, VersionedStatus};
use recommender_lib::{
    AggregateKey, CheckpointError, ContainerUsageSample, PodId, PodSpec, StatusError,
    WorkloadId, WorkloadSpec, WorkloadStatus,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Workloads and pods from the API server.
pub struct KubeClusterSource {
    ctx: KubeContext,
}

impl KubeClusterSource {
    pub fn new(ctx: KubeContext) -> Self {
        Self { ctx }
    }

    async fn target_selector(
        &self,
        namespace: &str,
        target: &TargetRef,
    ) -> Result<BTreeMap<String, String>> {
        let (group, version) = target.group_version();
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &target.kind));
        self.ctx.throttle().await;
        let object = self
            .ctx
            .namespaced(namespace, &resource)
            .get(&target.name)
            .await
            .with_context(|| format!("reading {} {namespace}/{}", target.kind, target.name))?;
        Ok(match_labels(&object.data))
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn list_workloads(&self) -> Result<Vec<WorkloadSpec>> {
        self.ctx.throttle().await;
        let objects = self
            .ctx
            .scoped(&vpa_resource())
            .list(&ListParams::default())
            .await
            .context("listing VerticalPodAutoscalers")?;

        let mut workloads = Vec::with_capacity(objects.items.len());
        for object in &objects.items {
            let Some((mut workload, target)) = workload_from_object(object) else {
                warn!(name = ?object.metadata.name, "Skipping unreadable VerticalPodAutoscaler");
                continue;
            };
            match target {
                Some(target) => match self.target_selector(&workload.id.namespace, &target).await {
                    Ok(selector) => workload.selector = selector,
                    Err(e) => {
                        warn!(workload = %workload.id, error = %e, "Target selector unavailable");
                    }
                },
                None => debug!(workload = %workload.id, "Workload has no target"),
            }
            workloads.push(workload);
        }
        Ok(workloads)
    }

    async fn list_pods(&self) -> Result<Vec<PodSpec>> {
        self.ctx.throttle().await;
        let pods = self
            .ctx
            .pods()
            .list(&ListParams::default())
            .await
            .context("listing pods")?;
        Ok(pods.items.iter().filter_map(pod_from_object).collect())
    }
}

/// Usage from the resource metrics API.
///
/// A pod's metrics are only returned when their timestamp moved since the
/// previous call.
pub struct KubeMetricsSource {
    ctx: KubeContext,
    last_seen: Mutex<HashMap<PodId, DateTime<Utc>>>,
}

impl KubeMetricsSource {
    pub fn new(ctx: KubeContext) -> Self {
        Self {
            ctx,
            last_seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MetricsSource for KubeMetricsSource {
    async fn container_usage(&self) -> Result<Vec<ContainerUsageSample>> {
        self.ctx.throttle().await;
        let objects = self
            .ctx
            .scoped(&pod_metrics_resource())
            .list(&ListParams::default())
            .await
            .context("listing pod metrics")?;

        let mut last_seen = self.last_seen.lock().await;
        let mut seen = HashMap::with_capacity(objects.items.len());
        let mut samples = Vec::new();
        for object in &objects.items {
            let Some((pod, timestamp, pod_samples)) = usage_from_pod_metrics(object) else {
                continue;
            };
            if last_seen.get(&pod).map_or(true, |last| timestamp > *last) {
                samples.extend(pod_samples);
            }
            seen.insert(pod, timestamp);
        }
        *last_seen = seen;
        Ok(samples)
    }
}

/// Writes recommendations to the VPA status subresource.
pub struct KubeStatusSink {
    ctx: KubeContext,
}

impl KubeStatusSink {
    pub fn new(ctx: KubeContext) -> Self {
        Self { ctx }
    }
}

fn status_error(workload: &WorkloadId, error: kube::Error) -> StatusError {
    match api_error_code(&error) {
        Some(409) => StatusError::Conflict(workload.to_string()),
        Some(404) => StatusError::NotFound(workload.to_string()),
        _ => StatusError::Transport(anyhow::Error::new(error)),
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn read_status(&self, workload: &WorkloadId) -> Result<VersionedStatus, StatusError> {
        self.ctx.throttle().await;
        let object = self
            .ctx
            .namespaced(&workload.namespace, &vpa_resource())
            .get(&workload.name)
            .await
            .map_err(|e| status_error(workload, e))?;
        Ok(VersionedStatus {
            status: workload_status(&object.data),
            version: object.metadata.resource_version.clone().unwrap_or_default(),
        })
    }

    async fn write_status(
        &self,
        workload: &WorkloadId,
        status: &WorkloadStatus,
        version: &str,
    ) -> Result<(), StatusError> {
        // The resourceVersion makes the patch fail with 409 on a stale read.
        let patch = json!({
            "metadata": { "resourceVersion": version },
            "status": VpaStatus::from(status),
        });
        self.ctx.throttle().await;
        self.ctx
            .namespaced(&workload.namespace, &vpa_resource())
            .patch_status(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| status_error(workload, e))?;
        Ok(())
    }
}

/// Checkpoints as VerticalPodAutoscalerCheckpoint objects.
pub struct KubeCheckpointStore {
    ctx: KubeContext,
}

impl KubeCheckpointStore {
    pub fn new(ctx: KubeContext) -> Self {
        Self { ctx }
    }
}

fn backend(error: kube::Error) -> CheckpointError {
    CheckpointError::Backend(anyhow::Error::new(error))
}

#[async_trait]
impl CheckpointStore for KubeCheckpointStore {
    async fn list(&self) -> Result<Vec<AggregateKey>, CheckpointError> {
        self.ctx.throttle().await;
        let objects = self
            .ctx
            .scoped(&checkpoint_resource())
            .list(&ListParams::default())
            .await
            .map_err(backend)?;
        Ok(objects.items.iter().filter_map(checkpoint_key).collect())
    }

    async fn load(&self, key: &AggregateKey) -> Result<ContainerCheckpoint, CheckpointError> {
        self.ctx.throttle().await;
        let object = self
            .ctx
            .namespaced(&key.workload.namespace, &checkpoint_resource())
            .get(&checkpoint_object_name(key))
            .await
            .map_err(|e| match api_error_code(&e) {
                Some(404) => CheckpointError::NotFound(key.to_string()),
                _ => backend(e),
            })?;
        let status = object
            .data
            .get("status")
            .cloned()
            .ok_or_else(|| CheckpointError::Corrupt(format!("{key}: no status")))?;
        let status: CheckpointStatus = serde_json::from_value(status)
            .map_err(|e| CheckpointError::Corrupt(format!("{key}: {e}")))?;
        Ok(status.into())
    }

    async fn save(
        &self,
        key: &AggregateKey,
        checkpoint: &ContainerCheckpoint,
    ) -> Result<(), CheckpointError> {
        let name = checkpoint_object_name(key);
        let api = self
            .ctx
            .namespaced(&key.workload.namespace, &checkpoint_resource());

        let object = json!({
            "apiVersion": "autoscaling.k8s.io/v1",
            "kind": "VerticalPodAutoscalerCheckpoint",
            "metadata": { "name": name, "namespace": key.workload.namespace },
            "spec": CheckpointSpec {
                vpa_object_name: key.workload.name.clone(),
                container_name: key.container.clone(),
            },
        });
        self.ctx.throttle().await;
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&object))
            .await
            .map_err(backend)?;

        let status = json!({ "status": CheckpointStatus::from(checkpoint) });
        self.ctx.throttle().await;
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &AggregateKey) -> Result<(), CheckpointError> {
        self.ctx.throttle().await;
        let deleted = self
            .ctx
            .namespaced(&key.workload.namespace, &checkpoint_resource())
            .delete(&checkpoint_object_name(key), &DeleteParams::default())
            .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if api_error_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }
}
