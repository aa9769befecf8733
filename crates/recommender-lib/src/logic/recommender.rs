//! Target and bounds for every container of a workload

use super::estimator::{
    ConfidenceMultiplier, MarginEstimator, MinResourcesEstimator, PercentileEstimator,
    ResourceEstimator,
};
use crate::models::{
    RecommendedContainerResources, ResourceAmount, ResourceName, Resources,
};
use crate::state::AggregateContainerState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const MIB: f64 = 1024.0 * 1024.0;

/// Percentiles, margins and per-pod floors of the recommender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderParams {
    pub target_cpu_percentile: f64,
    pub lower_bound_cpu_percentile: f64,
    pub upper_bound_cpu_percentile: f64,
    pub target_memory_percentile: f64,
    pub lower_bound_memory_percentile: f64,
    pub upper_bound_memory_percentile: f64,
    /// Fraction added on top of every estimate.
    pub safety_margin_fraction: f64,
    /// Smallest CPU recommended for a whole pod, in millicores.
    pub pod_min_cpu_millicores: f64,
    /// Smallest memory recommended for a whole pod, in MiB.
    pub pod_min_memory_mib: f64,
}

impl Default for RecommenderParams {
    fn default() -> Self {
        Self {
            target_cpu_percentile: 0.9,
            lower_bound_cpu_percentile: 0.5,
            upper_bound_cpu_percentile: 0.95,
            target_memory_percentile: 0.9,
            lower_bound_memory_percentile: 0.5,
            upper_bound_memory_percentile: 0.95,
            safety_margin_fraction: 0.15,
            pod_min_cpu_millicores: 25.0,
            pod_min_memory_mib: 250.0,
        }
    }
}

/// Computes uncapped recommendations from aggregate states.
///
/// The target is a margin-padded percentile. The lower and upper bounds
/// additionally scale with confidence, so they start wide and tighten as
/// history accumulates.
pub struct PodResourceRecommender {
    target: Arc<dyn ResourceEstimator>,
    lower_bound: Arc<dyn ResourceEstimator>,
    upper_bound: Arc<dyn ResourceEstimator>,
    params: RecommenderParams,
}

impl PodResourceRecommender {
    pub fn new(params: RecommenderParams) -> Self {
        let margin = params.safety_margin_fraction;
        let target: Arc<dyn ResourceEstimator> = Arc::new(MarginEstimator::new(
            margin,
            Arc::new(PercentileEstimator::new(
                params.target_cpu_percentile,
                params.target_memory_percentile,
            )),
        ));
        let lower: Arc<dyn ResourceEstimator> = Arc::new(MarginEstimator::new(
            margin,
            Arc::new(PercentileEstimator::new(
                params.lower_bound_cpu_percentile,
                params.lower_bound_memory_percentile,
            )),
        ));
        let upper: Arc<dyn ResourceEstimator> = Arc::new(MarginEstimator::new(
            margin,
            Arc::new(PercentileEstimator::new(
                params.upper_bound_cpu_percentile,
                params.upper_bound_memory_percentile,
            )),
        ));

        Self {
            target,
            lower_bound: Arc::new(ConfidenceMultiplier::new(0.001, -2.0, lower)),
            upper_bound: Arc::new(ConfidenceMultiplier::new(1.0, 1.0, upper)),
            params,
        }
    }

    pub fn params(&self) -> &RecommenderParams {
        &self.params
    }

    /// Recommend for each container that has data. Containers without
    /// samples are left out.
    pub fn recommend(
        &self,
        containers: &BTreeMap<String, AggregateContainerState>,
    ) -> Vec<RecommendedContainerResources> {
        if containers.is_empty() {
            return Vec::new();
        }
        let floor = self.container_floor(containers.len());
        let target = MinResourcesEstimator::new(floor.clone(), self.target.clone());
        let lower = MinResourcesEstimator::new(floor.clone(), self.lower_bound.clone());
        let upper = MinResourcesEstimator::new(floor, self.upper_bound.clone());

        containers
            .iter()
            .filter_map(|(name, aggregate)| {
                let target = target.estimate(aggregate)?;
                Some(RecommendedContainerResources {
                    container_name: name.clone(),
                    lower_bound: lower.estimate(aggregate).unwrap_or_default(),
                    upper_bound: upper.estimate(aggregate).unwrap_or_default(),
                    uncapped_target: target.clone(),
                    target,
                })
            })
            .collect()
    }

    /// Per-pod floors split evenly across `containers` containers.
    fn container_floor(&self, containers: usize) -> Resources {
        let fraction = 1.0 / containers as f64;
        [
            (
                ResourceName::Cpu,
                ResourceAmount::from_cores(self.params.pod_min_cpu_millicores * fraction / 1000.0),
            ),
            (
                ResourceName::Memory,
                ResourceAmount::from_bytes(self.params.pod_min_memory_mib * MIB * fraction),
            ),
        ]
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AggregationsConfig;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn aggregate(cpu: f64, memory: f64, minutes: i64) -> AggregateContainerState {
        let mut aggregate = AggregateContainerState::new(Arc::new(AggregationsConfig::default()), at(0));
        for minute in 0..minutes {
            aggregate
                .add_sample(ResourceName::Cpu, cpu, at(minute))
                .unwrap();
        }
        aggregate.add_memory_peak(memory, at(minutes)).unwrap();
        aggregate
    }

    #[test]
    fn test_bounds_bracket_target() {
        let containers: BTreeMap<_, _> = [("app".to_string(), aggregate(0.5, 512.0 * MIB, 120))].into();
        let recommendations = PodResourceRecommender::new(RecommenderParams::default()).recommend(&containers);

        assert_eq!(recommendations.len(), 1);
        let app = &recommendations[0];
        for resource in ResourceName::ALL {
            assert!(app.lower_bound[&resource] <= app.target[&resource]);
            assert!(app.target[&resource] <= app.upper_bound[&resource]);
        }
        assert_eq!(app.uncapped_target, app.target);
    }

    #[test]
    fn test_empty_aggregate_gets_no_recommendation() {
        let empty = AggregateContainerState::new(Arc::new(AggregationsConfig::default()), at(0));
        let containers: BTreeMap<_, _> = [
            ("app".to_string(), aggregate(0.5, 512.0 * MIB, 10)),
            ("sidecar".to_string(), empty),
        ]
        .into();
        let recommendations = PodResourceRecommender::new(RecommenderParams::default()).recommend(&containers);

        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].container_name, "app");
    }

    #[test]
    fn test_floor_is_split_across_containers() {
        let containers: BTreeMap<_, _> = [
            ("a".to_string(), aggregate(0.001, MIB, 10)),
            ("b".to_string(), aggregate(0.001, MIB, 10)),
        ]
        .into();
        let recommendations = PodResourceRecommender::new(RecommenderParams::default()).recommend(&containers);

        for container in &recommendations {
            assert_eq!(container.target[&ResourceName::Cpu], ResourceAmount(13));
            assert_eq!(
                container.target[&ResourceName::Memory],
                ResourceAmount::from_bytes(125.0 * MIB)
            );
        }
    }
}
