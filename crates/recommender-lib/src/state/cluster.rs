//! In-memory object graph of workloads, pods and aggregate usage models
//!
//! Workloads own their aggregates. Pods point at their workload by id only,
//! so dropping a workload drops every aggregate reachable from it.

use super::aggregate::AggregateContainerState;
use super::config::AggregationsConfig;
use super::container::ContainerState;
use crate::checkpoint::ContainerCheckpoint;
use crate::error::SampleError;
use crate::models::{
    AggregateKey, ContainerScalingMode, ContainerSpec, ContainerUsageSample, PodId, PodPhase,
    PodSpec, ResourceName, WorkloadId, WorkloadSpec, WorkloadStatus, OOM_KILLED_REASON,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A tracked workload.
#[derive(Debug, Clone)]
pub struct Workload {
    pub spec: WorkloadSpec,
    pub aggregates: BTreeMap<String, AggregateContainerState>,
    pub pods: BTreeSet<PodId>,
    pub status: WorkloadStatus,
}

impl Workload {
    fn new(spec: WorkloadSpec) -> Self {
        Self {
            spec,
            aggregates: BTreeMap::new(),
            pods: BTreeSet::new(),
            status: WorkloadStatus::default(),
        }
    }

    pub fn id(&self) -> &WorkloadId {
        &self.spec.id
    }
}

/// A tracked pod.
#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    pub workload: Option<WorkloadId>,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub containers: BTreeMap<String, ContainerState>,
}

/// Result of the most recent workload listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkloadListing {
    #[default]
    NotYetListed,
    Failed { at: DateTime<Utc> },
    /// Every workload that exists, including ones other recommenders own.
    Succeeded {
        at: DateTime<Utc>,
        existing: HashSet<WorkloadId>,
    },
}

/// What garbage collection may do with a stored checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDisposition {
    /// The workload exists.
    Keep,
    /// The workload is confirmed gone.
    Delete,
    /// Not known whether the workload exists; ask again next cycle.
    Defer,
}

/// Inputs for estimating one workload, detached from the live state.
#[derive(Debug, Clone)]
pub struct WorkloadView {
    pub spec: WorkloadSpec,
    pub pod_count: usize,
    /// Aggregates of containers that are autoscaled, with the open memory
    /// windows of live pods folded in.
    pub containers: BTreeMap<String, AggregateContainerState>,
}

/// The single source of truth for the estimator.
#[derive(Debug)]
pub struct ClusterState {
    config: Arc<AggregationsConfig>,
    workloads: HashMap<WorkloadId, Workload>,
    pods: HashMap<PodId, PodState>,
    listing: WorkloadListing,
}

impl ClusterState {
    pub fn new(config: Arc<AggregationsConfig>) -> Self {
        Self {
            config,
            workloads: HashMap::new(),
            pods: HashMap::new(),
            listing: WorkloadListing::NotYetListed,
        }
    }

    pub fn config(&self) -> &Arc<AggregationsConfig> {
        &self.config
    }

    pub fn workload(&self, id: &WorkloadId) -> Option<&Workload> {
        self.workloads.get(id)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn workload_ids(&self) -> Vec<WorkloadId> {
        let mut ids: Vec<_> = self.workloads.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn pod_ids(&self) -> Vec<PodId> {
        self.pods.keys().cloned().collect()
    }

    pub fn aggregate(&self, key: &AggregateKey) -> Option<&AggregateContainerState> {
        self.workloads
            .get(&key.workload)
            .and_then(|w| w.aggregates.get(&key.container))
    }

    pub fn num_aggregates(&self) -> usize {
        self.workloads.values().map(|w| w.aggregates.len()).sum()
    }

    pub fn listing(&self) -> &WorkloadListing {
        &self.listing
    }

    /// Track or update a workload. Returns whether anything changed.
    pub fn add_or_update_workload(&mut self, spec: WorkloadSpec, now: DateTime<Utc>) -> bool {
        let id = spec.id.clone();
        match self.workloads.get_mut(&id) {
            Some(existing) if existing.spec == spec => return false,
            Some(existing) => existing.spec = spec,
            None => {
                self.workloads.insert(id.clone(), Workload::new(spec));
            }
        }

        let candidates: Vec<PodId> = self
            .pods
            .keys()
            .filter(|pod| pod.namespace == id.namespace)
            .cloned()
            .collect();
        for pod in candidates {
            self.relink_pod(&pod, now);
        }
        self.apply_scaling_modes(&id);
        true
    }

    /// Stop tracking a workload, dropping its aggregates.
    pub fn delete_workload(&mut self, id: &WorkloadId, now: DateTime<Utc>) -> Option<Workload> {
        let workload = self.workloads.remove(id)?;
        for pod in &workload.pods {
            if let Some(state) = self.pods.get_mut(pod) {
                state.workload = None;
            }
        }
        for pod in &workload.pods {
            self.relink_pod(pod, now);
        }
        Some(workload)
    }

    /// Track or update a pod from its observed object.
    pub fn add_or_update_pod(&mut self, spec: &PodSpec, now: DateTime<Utc>) {
        let state = self.pods.entry(spec.id.clone()).or_insert_with(|| PodState {
            id: spec.id.clone(),
            workload: None,
            labels: BTreeMap::new(),
            phase: PodPhase::Unknown,
            containers: BTreeMap::new(),
        });
        state.labels = spec.labels.clone();
        state.phase = spec.phase;

        let mut dropped = Vec::new();
        state.containers.retain(|name, container| {
            let keep = spec.containers.iter().any(|c| &c.name == name);
            if !keep {
                dropped.push((name.clone(), container.clone()));
            }
            keep
        });
        for container in &spec.containers {
            let entry = state
                .containers
                .entry(container.name.clone())
                .or_insert_with(ContainerState::default);
            entry.requests = container.requests.clone();
            entry.limits = container.limits.clone();
        }
        let workload = state.workload.clone();

        if let Some(workload) = workload {
            for (name, mut container) in dropped {
                self.fold_into(&workload, &name, &mut container, now);
            }
        }

        self.relink_pod(&spec.id, now);

        if spec.phase.is_terminal() {
            self.fold_pod(&spec.id, now);
        } else {
            self.update_allocations(&spec.id, &spec.containers);
        }

        for container in &spec.containers {
            if let Some(termination) = &container.last_termination {
                if termination.reason == OOM_KILLED_REASON {
                    if let Err(err) =
                        self.record_oom(&spec.id, &container.name, termination.finished_at)
                    {
                        debug!(pod = %spec.id, container = %container.name, error = %err, "OOM not recorded");
                    }
                }
            }
        }
    }

    /// Stop tracking a pod, folding its open memory windows first.
    pub fn delete_pod(&mut self, id: &PodId, now: DateTime<Utc>) -> bool {
        self.fold_pod(id, now);
        let Some(state) = self.pods.remove(id) else {
            return false;
        };
        if let Some(workload) = state
            .workload
            .as_ref()
            .and_then(|w| self.workloads.get_mut(w))
        {
            workload.pods.remove(id);
        }
        true
    }

    /// Apply one usage sample to the pod's container and its aggregate.
    ///
    /// Returns whether the sample reached an aggregate. Samples of pods that
    /// no tracked workload owns, and CPU samples not newer than the last one
    /// applied, are ignored.
    pub fn add_sample(&mut self, sample: &ContainerUsageSample) -> Result<bool, SampleError> {
        let pod = self
            .pods
            .get_mut(&sample.pod)
            .ok_or_else(|| SampleError::UnknownPod(sample.pod.to_string()))?;
        let container =
            pod.containers
                .get_mut(&sample.container)
                .ok_or_else(|| SampleError::UnknownContainer {
                    pod: sample.pod.to_string(),
                    container: sample.container.clone(),
                })?;
        let Some(workload_id) = pod.workload.as_ref() else {
            return Ok(false);
        };
        let Some(aggregate) = self
            .workloads
            .get_mut(workload_id)
            .and_then(|w| w.aggregates.get_mut(&sample.container))
        else {
            return Ok(false);
        };

        match sample.resource {
            ResourceName::Cpu => {
                if !container.accept_cpu_sample(sample.timestamp) {
                    return Ok(false);
                }
                aggregate.add_sample(ResourceName::Cpu, sample.usage, sample.timestamp)?;
            }
            ResourceName::Memory => {
                let closed = container.add_memory_sample(
                    sample.usage,
                    sample.timestamp,
                    self.config.memory_aggregation_interval,
                );
                if let Some(peak) = closed {
                    aggregate.add_memory_peak(peak.bytes, sample.timestamp)?;
                }
            }
        }
        Ok(true)
    }

    /// Record an OOM kill of `container` in `pod` that finished at
    /// `finished_at`. Returns `false` when this kill was already recorded.
    pub fn record_oom(
        &mut self,
        pod: &PodId,
        container: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, SampleError> {
        let state = self
            .pods
            .get_mut(pod)
            .ok_or_else(|| SampleError::UnknownPod(pod.to_string()))?;
        let container_state =
            state
                .containers
                .get_mut(container)
                .ok_or_else(|| SampleError::UnknownContainer {
                    pod: pod.to_string(),
                    container: container.to_string(),
                })?;
        let Some(aggregate) = state
            .workload
            .as_ref()
            .and_then(|w| self.workloads.get_mut(w))
            .and_then(|w| w.aggregates.get_mut(container))
        else {
            return Ok(false);
        };
        if !container_state.accept_oom(finished_at) {
            return Ok(false);
        }

        let used = [
            container_state.last_memory_usage(),
            container_state
                .limits
                .get(&ResourceName::Memory)
                .map(|a| a.to_usage(ResourceName::Memory)),
            container_state
                .requests
                .get(&ResourceName::Memory)
                .map(|a| a.to_usage(ResourceName::Memory)),
        ]
        .into_iter()
        .flatten()
        .fold(0.0, f64::max);

        aggregate.record_oom(used, finished_at)?;
        Ok(true)
    }

    /// Keys of every aggregate that should be persisted.
    pub fn workloads_to_checkpoint(&self) -> Vec<AggregateKey> {
        let mut keys: Vec<AggregateKey> = self
            .workloads
            .values()
            .flat_map(|workload| {
                workload
                    .aggregates
                    .iter()
                    .filter(|(_, aggregate)| !aggregate.is_empty())
                    .map(|(container, _)| AggregateKey::new(workload.spec.id.clone(), container))
            })
            .collect();
        keys.sort();
        keys
    }

    /// Point-in-time checkpoint of one aggregate.
    pub fn checkpoint_of(
        &self,
        key: &AggregateKey,
        now: DateTime<Utc>,
    ) -> Option<ContainerCheckpoint> {
        self.aggregate(key)
            .map(|aggregate| aggregate.save_to_checkpoint(now))
    }

    /// Seed an aggregate from persisted state. Only tracked workloads accept
    /// restored aggregates.
    pub fn restore_aggregate(
        &mut self,
        key: &AggregateKey,
        restored: AggregateContainerState,
    ) -> Result<bool, SampleError> {
        let Some(workload) = self.workloads.get_mut(&key.workload) else {
            return Ok(false);
        };
        match workload.aggregates.get_mut(&key.container) {
            Some(existing) => existing.merge(&restored)?,
            None => {
                workload.aggregates.insert(key.container.clone(), restored);
            }
        }
        self.apply_scaling_modes(&key.workload);
        Ok(true)
    }

    /// Snapshot of what the estimator needs for one workload.
    pub fn estimation_view(&self, id: &WorkloadId) -> Option<WorkloadView> {
        let workload = self.workloads.get(id)?;
        let mut containers = BTreeMap::new();
        for (name, aggregate) in &workload.aggregates {
            if !aggregate.is_autoscaled() {
                continue;
            }
            let mut view = aggregate.clone();
            for pod in &workload.pods {
                let Some(peak) = self
                    .pods
                    .get(pod)
                    .and_then(|p| p.containers.get(name))
                    .and_then(|c| c.open_memory_peak())
                else {
                    continue;
                };
                if let Err(err) = view.add_memory_peak(peak.bytes, peak.observed_at) {
                    debug!(workload = %id, container = %name, error = %err, "open memory peak skipped");
                }
            }
            containers.insert(name.clone(), view);
        }
        Some(WorkloadView {
            spec: workload.spec.clone(),
            pod_count: workload
                .pods
                .iter()
                .filter(|p| self.pods.get(p).is_some_and(|s| !s.phase.is_terminal()))
                .count(),
            containers,
        })
    }

    /// Store the latest status. Returns whether it differs from the previous one.
    pub fn set_recommendation(&mut self, id: &WorkloadId, status: WorkloadStatus) -> bool {
        match self.workloads.get_mut(id) {
            Some(workload) => {
                let changed = !workload.status.is_equivalent(&status);
                workload.status = status;
                changed
            }
            None => false,
        }
    }

    /// Drop aggregates whose container no live pod runs and that have had no
    /// sample inside the memory aggregation window.
    pub fn garbage_collect_aggregates(&mut self, now: DateTime<Utc>) -> Vec<AggregateKey> {
        let mut removed = Vec::new();
        for workload in self.workloads.values_mut() {
            let live: HashSet<&String> = workload
                .pods
                .iter()
                .filter_map(|p| self.pods.get(p))
                .filter(|p| !p.phase.is_terminal())
                .flat_map(|p| p.containers.keys())
                .collect();
            let expired: Vec<String> = workload
                .aggregates
                .iter()
                .filter(|(name, aggregate)| !live.contains(name) && aggregate.is_expired(now))
                .map(|(name, _)| name.clone())
                .collect();
            for name in expired {
                workload.aggregates.remove(&name);
                removed.push(AggregateKey::new(workload.spec.id.clone(), name));
            }
        }
        removed.sort();
        removed
    }

    /// Remember the outcome of the latest workload listing. On success,
    /// `existing` holds every workload in scope, whoever owns it.
    pub fn record_workload_listing(
        &mut self,
        outcome: Result<HashSet<WorkloadId>, ()>,
        now: DateTime<Utc>,
    ) {
        self.listing = match outcome {
            Ok(existing) => WorkloadListing::Succeeded { at: now, existing },
            Err(()) => {
                warn!("workload listing failed, checkpoint deletion deferred");
                WorkloadListing::Failed { at: now }
            }
        };
    }

    /// Whether the checkpoint stored under `key` may be deleted.
    ///
    /// A workload that is tracked or was seen by the last successful listing
    /// keeps its checkpoints. Deletion requires a successful listing that
    /// did not contain the workload.
    pub fn checkpoint_disposition(&self, key: &AggregateKey) -> CheckpointDisposition {
        if self.workloads.contains_key(&key.workload) {
            return CheckpointDisposition::Keep;
        }
        match &self.listing {
            WorkloadListing::Succeeded { existing, .. } if existing.contains(&key.workload) => {
                CheckpointDisposition::Keep
            }
            WorkloadListing::Succeeded { .. } => CheckpointDisposition::Delete,
            WorkloadListing::NotYetListed | WorkloadListing::Failed { .. } => {
                CheckpointDisposition::Defer
            }
        }
    }

    fn owning_workload(&self, pod: &PodId) -> Option<WorkloadId> {
        let state = self.pods.get(pod)?;
        let spec = PodSpec {
            id: pod.clone(),
            labels: state.labels.clone(),
            phase: state.phase,
            containers: vec![],
        };
        self.workloads
            .values()
            .filter(|w| w.spec.matches(&spec))
            .map(|w| w.spec.id.clone())
            .min()
    }

    fn relink_pod(&mut self, pod: &PodId, now: DateTime<Utc>) {
        let owner = self.owning_workload(pod);
        let Some(state) = self.pods.get(pod) else {
            return;
        };
        if state.workload == owner {
            if let Some(owner) = &owner {
                self.ensure_aggregates(pod, owner, now);
            }
            return;
        }

        if let Some(previous) = state.workload.clone() {
            self.fold_pod(pod, now);
            if let Some(workload) = self.workloads.get_mut(&previous) {
                workload.pods.remove(pod);
            }
        }
        if let Some(state) = self.pods.get_mut(pod) {
            state.workload = owner.clone();
        }
        if let Some(owner) = owner {
            if let Some(workload) = self.workloads.get_mut(&owner) {
                workload.pods.insert(pod.clone());
            }
            self.ensure_aggregates(pod, &owner, now);
        }
    }

    fn ensure_aggregates(&mut self, pod: &PodId, owner: &WorkloadId, now: DateTime<Utc>) {
        let Some(state) = self.pods.get(pod) else {
            return;
        };
        let Some(workload) = self.workloads.get_mut(owner) else {
            return;
        };
        for (name, container) in &state.containers {
            workload.aggregates.entry(name.clone()).or_insert_with(|| {
                let mut aggregate = AggregateContainerState::new(self.config.clone(), now);
                aggregate.update_allocation(&container.requests, &container.limits);
                if workload.spec.resource_policy.mode_for(name) == ContainerScalingMode::Off {
                    aggregate.mark_not_autoscaled();
                }
                aggregate
            });
        }
    }

    fn update_allocations(&mut self, pod: &PodId, containers: &[ContainerSpec]) {
        let Some(owner) = self.pods.get(pod).and_then(|p| p.workload.clone()) else {
            return;
        };
        let Some(workload) = self.workloads.get_mut(&owner) else {
            return;
        };
        for container in containers {
            if let Some(aggregate) = workload.aggregates.get_mut(&container.name) {
                aggregate.update_allocation(&container.requests, &container.limits);
            }
        }
    }

    fn apply_scaling_modes(&mut self, id: &WorkloadId) {
        let Some(workload) = self.workloads.get_mut(id) else {
            return;
        };
        for (name, aggregate) in workload.aggregates.iter_mut() {
            match workload.spec.resource_policy.mode_for(name) {
                ContainerScalingMode::Off => aggregate.mark_not_autoscaled(),
                ContainerScalingMode::Auto => aggregate.mark_autoscaled(),
            }
        }
    }

    fn fold_pod(&mut self, pod: &PodId, now: DateTime<Utc>) {
        let Some(state) = self.pods.get_mut(pod) else {
            return;
        };
        let Some(owner) = state.workload.clone() else {
            return;
        };
        let Some(workload) = self.workloads.get_mut(&owner) else {
            return;
        };
        for (name, container) in state.containers.iter_mut() {
            if let Some(aggregate) = workload.aggregates.get_mut(name) {
                if let Err(err) = aggregate.fold_terminated_instance(container, now) {
                    debug!(pod = %pod, container = %name, error = %err, "final memory peak dropped");
                }
            }
        }
    }

    fn fold_into(
        &mut self,
        workload: &WorkloadId,
        container_name: &str,
        container: &mut ContainerState,
        now: DateTime<Utc>,
    ) {
        if let Some(aggregate) = self
            .workloads
            .get_mut(workload)
            .and_then(|w| w.aggregates.get_mut(container_name))
        {
            if let Err(err) = aggregate.fold_terminated_instance(container, now) {
                debug!(workload = %workload, container = %container_name, error = %err, "final memory peak dropped");
            }
        }
    }
}
