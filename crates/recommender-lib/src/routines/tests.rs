//! End-to-end cycles against in-memory collaborators

use super::fakes::MemoryStatusSink;
use super::*;
use crate::checkpoint::{
    CheckpointGarbageCollector, CheckpointStore, CheckpointWriter, CheckpointWriterConfig,
    MemoryCheckpointStore,
};
use crate::health::HealthRegistry;
use crate::input::fakes::{FakeCluster, FakeMetrics};
use crate::input::{ClusterStateFeeder, FeederConfig, InitializationStrategy};
use crate::logic::{PodResourceRecommender, PostProcessorChain, RecommenderParams};
use crate::models::{
    AggregateKey, ConditionType, ContainerSpec, ContainerTermination, ContainerUsageSample, PodId,
    PodPhase, PodSpec, ResourceAmount, ResourceName, ResourcePolicy, Resources, WorkloadId,
    WorkloadSpec, OOM_KILLED_REASON,
};
use crate::state::{AggregationsConfig, ClusterState};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const MIB: i64 = 1024 * 1024;

fn web() -> WorkloadId {
    WorkloadId::new("default", "web")
}

fn web_key() -> AggregateKey {
    AggregateKey::new(web(), "app")
}

fn workload_spec() -> WorkloadSpec {
    WorkloadSpec {
        id: web(),
        selector: [("app".to_string(), "web".to_string())].into(),
        recommenders: vec![],
        resource_policy: ResourcePolicy::default(),
        annotations: BTreeMap::new(),
    }
}

fn pod_spec(memory_limit: i64) -> PodSpec {
    PodSpec {
        id: PodId::new("default", "web-1"),
        labels: [("app".to_string(), "web".to_string())].into(),
        phase: PodPhase::Running,
        containers: vec![ContainerSpec {
            name: "app".to_string(),
            requests: [(ResourceName::Cpu, ResourceAmount(100))].into(),
            limits: [(ResourceName::Memory, ResourceAmount(memory_limit))].into(),
            last_termination: None,
        }],
    }
}

fn cpu_sample(usage: f64, minutes_ago: i64) -> ContainerUsageSample {
    ContainerUsageSample {
        pod: PodId::new("default", "web-1"),
        container: "app".to_string(),
        resource: ResourceName::Cpu,
        usage,
        timestamp: Utc::now() - Duration::minutes(minutes_ago),
    }
}

struct World {
    cluster_source: Arc<FakeCluster>,
    metrics_source: Arc<FakeMetrics>,
    checkpoints: Arc<MemoryCheckpointStore>,
    statuses: Arc<MemoryStatusSink>,
    health: HealthRegistry,
}

impl World {
    fn new() -> Self {
        let world = Self {
            cluster_source: Arc::new(FakeCluster::default()),
            metrics_source: Arc::new(FakeMetrics::default()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            statuses: Arc::new(MemoryStatusSink::default()),
            health: HealthRegistry::new(),
        };
        world.cluster_source.set_workloads(vec![workload_spec()]);
        world.statuses.create(&web());
        world
    }

    /// A fresh process: new model, same external collaborators.
    fn recommender(&self, params: RecommenderParams) -> Recommender {
        let cluster = Arc::new(RwLock::new(ClusterState::new(Arc::new(
            AggregationsConfig::default(),
        ))));
        let feeder = ClusterStateFeeder::new(
            cluster,
            self.cluster_source.clone(),
            self.metrics_source.clone(),
            self.checkpoints.clone(),
            FeederConfig::default(),
        );
        Recommender::new(
            feeder,
            PodResourceRecommender::new(params),
            PostProcessorChain::default(),
            StatusWriter::new(self.statuses.clone()),
            self.health.clone(),
            RunOnceConfig::default(),
        )
    }

    fn cluster(recommender: &Recommender) -> Arc<RwLock<ClusterState>> {
        recommender.feeder().cluster().clone()
    }
}

fn no_margin() -> RecommenderParams {
    RecommenderParams {
        safety_margin_fraction: 0.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_steady_cpu_recommends_observed_usage() {
    let world = World::new();
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world
        .metrics_source
        .push([cpu_sample(0.1, 3), cpu_sample(0.1, 2), cpu_sample(0.1, 1)]);

    let mut recommender = world.recommender(no_margin());
    let summary = recommender.run_once().await;
    assert_eq!(summary.workloads, 1);
    assert_eq!(summary.statuses_written, 1);

    let status = world.statuses.status(&web()).unwrap();
    let recommendation = status.recommendation.unwrap();
    let cpu = recommendation.container("app").unwrap().target[&ResourceName::Cpu];
    assert!(
        (100..=115).contains(&cpu.0),
        "100m samples should recommend about 100m, got {}m",
        cpu.0
    );
}

#[tokio::test]
async fn test_oom_kill_raises_memory_above_limit() {
    let world = World::new();
    let limit = 512 * MIB;
    let mut pod = pod_spec(limit);
    pod.containers[0].last_termination = Some(ContainerTermination {
        reason: OOM_KILLED_REASON.to_string(),
        finished_at: Utc::now() - Duration::minutes(1),
    });
    world.cluster_source.set_pods(vec![pod]);
    world.metrics_source.push([cpu_sample(0.2, 1)]);

    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;
    // The same termination is reported again on the next listing.
    recommender.run_once().await;

    let cluster = World::cluster(&recommender);
    let cluster = cluster.read().await;
    let memory = cluster.aggregate(&web_key()).unwrap().memory_histogram();
    assert!(memory.percentile(1.0).unwrap() >= limit as f64);
    let weight = memory.total_weight();
    assert!(weight > 0.9 && weight < 1.1, "OOM counted once, weight {weight}");

    let status = world.statuses.status(&web()).unwrap();
    let target = status.recommendation.unwrap().container("app").unwrap().target[&ResourceName::Memory];
    assert!(target.0 >= limit);
}

#[tokio::test]
async fn test_workload_without_data_gets_no_recommendation() {
    let world = World::new();
    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;

    let status = world.statuses.status(&web()).unwrap();
    assert!(status.recommendation.is_none());
    assert!(status.condition(ConditionType::NoPodsMatched).unwrap().status);
    assert!(!status.condition(ConditionType::RecommendationProvided).unwrap().status);
}

#[tokio::test]
async fn test_unchanged_status_is_not_rewritten() {
    let world = World::new();
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world.metrics_source.push([cpu_sample(0.3, 2)]);

    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;
    let writes = world.statuses.writes();
    let second = recommender.run_once().await;

    assert_eq!(second.statuses_written, 0);
    assert_eq!(world.statuses.writes(), writes);
}

#[tokio::test]
async fn test_deleted_workload_checkpoint_is_collected() {
    let world = World::new();
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world.metrics_source.push([cpu_sample(0.3, 2)]);

    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;
    let cluster = World::cluster(&recommender);
    let mut writer = CheckpointWriter::new(
        cluster.clone(),
        world.checkpoints.clone(),
        CheckpointWriterConfig::default(),
    );
    writer.store_checkpoints(Utc::now()).await;
    assert!(world.checkpoints.contains(&web_key()));

    let gc = CheckpointGarbageCollector::new(cluster.clone(), world.checkpoints.clone());

    // A failed listing must not look like a deletion.
    world.cluster_source.set_workloads(vec![]);
    world.cluster_source.fail_workload_listing(true);
    recommender.run_once().await;
    gc.collect().await.unwrap();
    assert!(world.checkpoints.contains(&web_key()));

    world.cluster_source.fail_workload_listing(false);
    recommender.run_once().await;
    let summary = gc.collect().await.unwrap();
    assert_eq!(summary.deleted, vec![web_key()]);
    assert!(!world.checkpoints.contains(&web_key()));
}

#[tokio::test]
async fn test_quiet_workload_keeps_its_checkpoint() {
    let world = World::new();
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world.metrics_source.push([cpu_sample(0.3, 2)]);

    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;
    let cluster = World::cluster(&recommender);
    CheckpointWriter::new(cluster.clone(), world.checkpoints.clone(), CheckpointWriterConfig::default())
        .store_checkpoints(Utc::now())
        .await;

    // Pods gone and no new samples; the workload itself still exists.
    world.cluster_source.set_pods(vec![]);
    recommender.run_once().await;
    let summary = CheckpointGarbageCollector::new(cluster, world.checkpoints.clone())
        .collect()
        .await
        .unwrap();
    assert!(summary.deleted.is_empty());
    assert!(world.checkpoints.contains(&web_key()));
}

#[tokio::test]
async fn test_restart_from_checkpoint_reproduces_recommendation() {
    let world = World::new();
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world.metrics_source.push((1..=30).rev().map(|m| cpu_sample(0.25, m)));

    let mut first = world.recommender(RecommenderParams::default());
    first.run_once().await;
    CheckpointWriter::new(
        World::cluster(&first),
        world.checkpoints.clone(),
        CheckpointWriterConfig::default(),
    )
    .store_checkpoints(Utc::now())
    .await;
    let before = world.statuses.status(&web()).unwrap().recommendation.unwrap();

    let mut second = world.recommender(RecommenderParams::default());
    let init = second
        .feeder()
        .init(&InitializationStrategy::Checkpoint)
        .await
        .unwrap();
    assert_eq!(init.restored_aggregates, 1);
    second.run_once().await;

    let cluster = World::cluster(&second);
    let restored = cluster.read().await.aggregate(&web_key()).unwrap().total_samples_count();
    assert_eq!(restored, 30);
    let after = world.statuses.status(&web()).unwrap().recommendation.unwrap();
    assert_eq!(
        before.container("app").unwrap().target[&ResourceName::Cpu],
        after.container("app").unwrap().target[&ResourceName::Cpu]
    );
}

#[tokio::test]
async fn test_cycle_updates_liveness() {
    let world = World::new();
    let mut recommender = world.recommender(RecommenderParams::default());
    assert!(world.health.last_run_once().await.is_none());

    recommender.run_once().await;
    let liveness = world.health.liveness(Utc::now()).await;
    assert!(liveness.alive);
    assert!(liveness.last_run_once.is_some());
}

#[tokio::test]
async fn test_policy_caps_published_target() {
    let world = World::new();
    let mut spec = workload_spec();
    spec.resource_policy = ResourcePolicy {
        container_policies: vec![crate::models::ContainerResourcePolicy {
            container_name: "app".to_string(),
            max_allowed: Resources::from([(ResourceName::Cpu, ResourceAmount(50))]),
            ..Default::default()
        }],
    };
    world.cluster_source.set_workloads(vec![spec]);
    world.cluster_source.set_pods(vec![pod_spec(512 * MIB)]);
    world.metrics_source.push([cpu_sample(2.0, 2)]);

    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;

    let status = world.statuses.status(&web()).unwrap();
    let app = status.recommendation.unwrap().container("app").unwrap().clone();
    assert_eq!(app.target[&ResourceName::Cpu], ResourceAmount(50));
    assert!(app.uncapped_target[&ResourceName::Cpu] > ResourceAmount(2000));
}

#[tokio::test]
async fn test_checkpoint_store_is_untouched_without_data() {
    let world = World::new();
    let mut recommender = world.recommender(RecommenderParams::default());
    recommender.run_once().await;

    let mut writer = CheckpointWriter::new(
        World::cluster(&recommender),
        world.checkpoints.clone(),
        CheckpointWriterConfig::default(),
    );
    let summary = writer.store_checkpoints(Utc::now()).await;
    assert_eq!(summary.written, 0);
    assert!(world.checkpoints.list().await.unwrap().is_empty());
}
