//! Transforms applied to raw recommendations before they are published

use crate::models::{
    ContainerScalingMode, Recommendation, RecommendedContainerResources, ResourceAmount,
    ResourceName, Resources,
};
use crate::state::WorkloadView;

/// Annotation prefix opting a container into whole-core CPU recommendations:
/// `vpa-post-processor.kubernetes.io/<container>_integerCPU: "true"`.
pub const INTEGER_CPU_ANNOTATION_PREFIX: &str = "vpa-post-processor.kubernetes.io/";
pub const INTEGER_CPU_ANNOTATION_SUFFIX: &str = "_integerCPU";

/// One stage of the post-processing chain.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, workload: &WorkloadView, recommendation: Recommendation) -> Recommendation;
}

/// Rounds CPU up to whole cores for containers that opted in.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerCpuPostProcessor;

impl IntegerCpuPostProcessor {
    fn opted_in(workload: &WorkloadView, container: &str) -> bool {
        let key = format!("{INTEGER_CPU_ANNOTATION_PREFIX}{container}{INTEGER_CPU_ANNOTATION_SUFFIX}");
        workload
            .spec
            .annotations
            .get(&key)
            .is_some_and(|value| value == "true")
    }
}

fn round_up_cpu(resources: &mut Resources) {
    if let Some(amount) = resources.get_mut(&ResourceName::Cpu) {
        let millicores = amount.0;
        let whole = millicores.saturating_add(999) / 1000;
        *amount = ResourceAmount(whole.saturating_mul(1000).max(millicores));
    }
}

impl PostProcessor for IntegerCpuPostProcessor {
    fn name(&self) -> &'static str {
        "integer_cpu"
    }

    fn process(&self, workload: &WorkloadView, mut recommendation: Recommendation) -> Recommendation {
        for container in recommendation.containers.iter_mut() {
            if !Self::opted_in(workload, &container.container_name) {
                continue;
            }
            round_up_cpu(&mut container.target);
            round_up_cpu(&mut container.lower_bound);
            round_up_cpu(&mut container.upper_bound);
            round_up_cpu(&mut container.uncapped_target);
        }
        recommendation
    }
}

/// Applies the container resource policy: drops containers that are not
/// autoscaled and resources that are not controlled, then clamps into
/// `[min_allowed, max_allowed]` and below `max_limit_multiple` × the current
/// limit. `uncapped_target` keeps the value from before clamping.
#[derive(Debug, Default, Clone, Copy)]
pub struct CappingPostProcessor;

impl CappingPostProcessor {
    fn cap_container(
        workload: &WorkloadView,
        mut container: RecommendedContainerResources,
    ) -> Option<RecommendedContainerResources> {
        let policy = workload
            .spec
            .resource_policy
            .for_container(&container.container_name);
        if policy.is_some_and(|p| p.mode == ContainerScalingMode::Off) {
            return None;
        }

        if let Some(policy) = policy {
            for resources in [
                &mut container.target,
                &mut container.lower_bound,
                &mut container.upper_bound,
                &mut container.uncapped_target,
            ] {
                resources.retain(|resource, _| policy.controls(*resource));
            }
        }
        container.uncapped_target = container.target.clone();

        let limits = workload
            .containers
            .get(&container.container_name)
            .map(|aggregate| aggregate.last_limits().clone())
            .unwrap_or_default();

        for resources in [
            &mut container.target,
            &mut container.lower_bound,
            &mut container.upper_bound,
        ] {
            for (resource, amount) in resources.iter_mut() {
                let mut capped = *amount;
                if let Some(policy) = policy {
                    if let (Some(multiple), Some(limit)) =
                        (policy.max_limit_multiple, limits.get(resource))
                    {
                        capped = capped.min(limit.scale(multiple));
                    }
                    if let Some(max) = policy.max_allowed.get(resource) {
                        capped = capped.min(*max);
                    }
                    if let Some(min) = policy.min_allowed.get(resource) {
                        capped = capped.max(*min);
                    }
                }
                *amount = capped;
            }
        }

        if container.target.is_empty() {
            return None;
        }
        Some(container)
    }
}

impl PostProcessor for CappingPostProcessor {
    fn name(&self) -> &'static str {
        "capping"
    }

    fn process(&self, workload: &WorkloadView, recommendation: Recommendation) -> Recommendation {
        Recommendation {
            containers: recommendation
                .containers
                .into_iter()
                .filter_map(|container| Self::cap_container(workload, container))
                .collect(),
        }
    }
}

/// Ordered post-processors with capping always in last position.
pub struct PostProcessorChain {
    processors: Vec<Box<dyn PostProcessor>>,
}

impl PostProcessorChain {
    /// The standard chain: optional integer CPU rounding, then capping.
    pub fn new(integer_cpu_enabled: bool) -> Self {
        let mut stages: Vec<Box<dyn PostProcessor>> = Vec::new();
        if integer_cpu_enabled {
            stages.push(Box::new(IntegerCpuPostProcessor));
        }
        Self::with_stages(stages)
    }

    /// Run `stages` in order, followed by capping.
    pub fn with_stages(mut stages: Vec<Box<dyn PostProcessor>>) -> Self {
        stages.push(Box::new(CappingPostProcessor));
        Self { processors: stages }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn apply(&self, workload: &WorkloadView, recommendation: Recommendation) -> Recommendation {
        self.processors
            .iter()
            .fold(recommendation, |recommendation, processor| {
                processor.process(workload, recommendation)
            })
    }
}

impl Default for PostProcessorChain {
    fn default() -> Self {
        Self::new(false)
    }
}
