//! Vertical resource recommender engine
//!
//! This crate provides the core functionality for:
//! - Decaying usage histograms per workload container
//! - Cluster state fed from orchestrator objects and usage metrics
//! - Percentile-based recommendations with policy capping
//! - Checkpointing of the usage model across restarts
//! - Health checks and observability

pub mod checkpoint;
pub mod error;
pub mod health;
pub mod histogram;
pub mod input;
pub mod logic;
pub mod models;
pub mod observability;
pub mod routines;
pub mod state;

pub use error::{CheckpointError, HistogramError, SampleError, StatusError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, LivenessResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{RecommenderMetrics, StructuredLogger};
