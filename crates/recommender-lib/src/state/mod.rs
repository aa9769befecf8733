//! Cluster state: what the engine knows about workloads, pods and usage

mod aggregate;
mod cluster;
mod config;
mod container;

pub use aggregate::AggregateContainerState;
pub use cluster::{
    CheckpointDisposition, ClusterState, PodState, Workload, WorkloadListing, WorkloadView,
};
pub use config::{AggregationsConfig, SampleWeighting};
pub use container::{ContainerState, MemoryPeak};
