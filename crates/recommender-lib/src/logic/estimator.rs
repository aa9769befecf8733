//! Estimators turning an aggregate usage model into resource amounts
//!
//! Estimators compose: a percentile estimator reads the histograms, and the
//! margin, confidence and floor estimators wrap another estimator and adjust
//! its output.

use crate::models::{ResourceAmount, ResourceName, Resources};
use crate::state::AggregateContainerState;
use std::sync::Arc;

/// Computes per-resource amounts for one aggregate.
///
/// `None` means the aggregate has no samples, which is distinct from an
/// estimate of zero.
pub trait ResourceEstimator: Send + Sync {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Option<Resources>;
}

/// Reads a fixed percentile from each histogram.
#[derive(Debug, Clone, Copy)]
pub struct PercentileEstimator {
    pub cpu_percentile: f64,
    pub memory_percentile: f64,
}

impl PercentileEstimator {
    pub fn new(cpu_percentile: f64, memory_percentile: f64) -> Self {
        Self {
            cpu_percentile,
            memory_percentile,
        }
    }
}

impl ResourceEstimator for PercentileEstimator {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Option<Resources> {
        if aggregate.total_samples_count() == 0 && aggregate.is_empty() {
            return None;
        }
        let mut resources = Resources::new();
        if let Some(cores) = aggregate.cpu_histogram().percentile(self.cpu_percentile) {
            resources.insert(ResourceName::Cpu, ResourceAmount::from_cores(cores));
        }
        if let Some(bytes) = aggregate
            .memory_histogram()
            .percentile(self.memory_percentile)
        {
            resources.insert(ResourceName::Memory, ResourceAmount::from_bytes(bytes));
        }
        (!resources.is_empty()).then_some(resources)
    }
}

/// Adds a fractional margin on top of the wrapped estimate.
pub struct MarginEstimator {
    margin: f64,
    base: Arc<dyn ResourceEstimator>,
}

impl MarginEstimator {
    pub fn new(margin: f64, base: Arc<dyn ResourceEstimator>) -> Self {
        Self { margin, base }
    }
}

impl ResourceEstimator for MarginEstimator {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Option<Resources> {
        let mut resources = self.base.estimate(aggregate)?;
        for amount in resources.values_mut() {
            *amount = amount.scale(1.0 + self.margin);
        }
        Some(resources)
    }
}

/// Scales the wrapped estimate by `(1 + multiplier / confidence) ^ exponent`.
///
/// With little data the factor moves the estimate away from the target: an
/// upper bound (positive exponent) grows, a lower bound (negative exponent)
/// shrinks. Both converge to the wrapped estimate as confidence grows.
pub struct ConfidenceMultiplier {
    multiplier: f64,
    exponent: f64,
    base: Arc<dyn ResourceEstimator>,
}

impl ConfidenceMultiplier {
    pub fn new(multiplier: f64, exponent: f64, base: Arc<dyn ResourceEstimator>) -> Self {
        Self {
            multiplier,
            exponent,
            base,
        }
    }

    fn factor(&self, confidence: f64) -> f64 {
        (1.0 + self.multiplier / confidence).powf(self.exponent)
    }
}

impl ResourceEstimator for ConfidenceMultiplier {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Option<Resources> {
        let mut resources = self.base.estimate(aggregate)?;
        let factor = self.factor(aggregate.confidence());
        for amount in resources.values_mut() {
            *amount = amount.scale(factor);
        }
        Some(resources)
    }
}

/// Raises the wrapped estimate to at least `min` per resource.
pub struct MinResourcesEstimator {
    min: Resources,
    base: Arc<dyn ResourceEstimator>,
}

impl MinResourcesEstimator {
    pub fn new(min: Resources, base: Arc<dyn ResourceEstimator>) -> Self {
        Self { min, base }
    }
}

impl ResourceEstimator for MinResourcesEstimator {
    fn estimate(&self, aggregate: &AggregateContainerState) -> Option<Resources> {
        let mut resources = self.base.estimate(aggregate)?;
        for (resource, amount) in resources.iter_mut() {
            if let Some(min) = self.min.get(resource) {
                *amount = (*amount).max(*min);
            }
        }
        Some(resources)
    }
}
