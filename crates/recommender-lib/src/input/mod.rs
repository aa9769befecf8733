//! Inputs of the model: orchestrator objects, live usage, usage history

mod feeder;
mod history;
mod source;

#[cfg(test)]
pub(crate) mod fakes;

pub use feeder::{
    ClusterStateFeeder, FeederConfig, InitSummary, InitializationStrategy, RefreshSummary,
    SampleSummary,
};
pub use history::{PrometheusHistoryConfig, PrometheusHistoryProvider};
pub use source::{ClusterHistory, ClusterSource, HistoryProvider, MetricsSource, PodHistory};
