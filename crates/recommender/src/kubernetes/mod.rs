//! Kubernetes-backed sources and sinks
//!
//! Workloads are VerticalPodAutoscaler objects, usage comes from the
//! metrics.k8s.io API, checkpoints live in VerticalPodAutoscalerCheckpoint
//! objects and recommendations are written to the VPA status subresource.

mod adapters;
pub mod convert;

pub use adapters::{KubeCheckpointStore, KubeClusterSource, KubeMetricsSource, KubeStatusSink};

use crate::ratelimit::RateLimiter;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use std::sync::Arc;

/// Field manager of server-side applies.
pub const FIELD_MANAGER: &str = "vpa-recommender";

pub fn vpa_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("autoscaling.k8s.io", "v1", "VerticalPodAutoscaler"),
        "verticalpodautoscalers",
    )
}

pub fn checkpoint_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("autoscaling.k8s.io", "v1", "VerticalPodAutoscalerCheckpoint"),
        "verticalpodautoscalercheckpoints",
    )
}

pub fn pod_metrics_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics"),
        "pods",
    )
}

/// Client, namespace scope and throttle shared by the adapters.
#[derive(Clone)]
pub struct KubeContext {
    client: Client,
    namespace: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl KubeContext {
    pub fn new(client: Client, namespace: Option<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            namespace,
            limiter,
        }
    }

    async fn throttle(&self) {
        self.limiter.acquire().await;
    }

    /// Objects of `resource` in scope: one namespace or the whole cluster.
    fn scoped(&self, resource: &ApiResource) -> Api<DynamicObject> {
        match &self.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn namespaced(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn pods(&self) -> Api<Pod> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

/// HTTP status of an API error response.
fn api_error_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}
