//! Process wiring of the vertical recommender: configuration, Kubernetes
//! adapters and the HTTP API

pub mod api;
pub mod config;
pub mod kubernetes;
pub mod quantity;
pub mod ratelimit;
