//! VPA Recommender - vertical resource recommendations for workloads
//!
//! Watches VerticalPodAutoscaler objects, keeps decaying usage histograms
//! per container and writes recommended requests back to each object.

use anyhow::{Context, Result};
use recommender_lib::{
    checkpoint::{
        CheckpointGarbageCollector, CheckpointStore, CheckpointWriter, FileCheckpointStore,
    },
    health::{components, HealthRegistry},
    input::{ClusterStateFeeder, InitializationStrategy, PrometheusHistoryProvider},
    logic::{PodResourceRecommender, PostProcessorChain, RecommenderParams},
    observability::StructuredLogger,
    routines::{
        run_periodically, CheckpointGcRoutine, CheckpointWriterRoutine, Recommender,
        RunOnceConfig, StatusWriter,
    },
    state::ClusterState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpa_recommender::{
    api,
    config::{RecommenderConfig, StorageMode},
    kubernetes::{
        KubeCheckpointStore, KubeClusterSource, KubeContext, KubeMetricsSource, KubeStatusSink,
    },
    ratelimit::RateLimiter,
};

const RECOMMENDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vpa-recommender");

    let config = RecommenderConfig::load()?;
    info!(
        recommender_name = %config.recommender_name,
        namespace = %config.namespace,
        storage = ?config.storage,
        "Recommender configured"
    );

    let health_registry =
        HealthRegistry::new().with_liveness_threshold(config.liveness_threshold());
    for component in [
        components::FEEDER,
        components::RECOMMENDER,
        components::CHECKPOINT_WRITER,
        components::CHECKPOINT_GC,
    ] {
        health_registry.register(component).await;
    }

    let logger = StructuredLogger::new(&config.recommender_name);

    let mut kube_config = kube::Config::infer()
        .await
        .context("Failed to load Kubernetes client configuration")?;
    kube_config.read_timeout = Some(config.api_timeout());
    let client =
        kube::Client::try_from(kube_config).context("Failed to create Kubernetes client")?;
    let ctx = KubeContext::new(
        client,
        config.namespace_scope(),
        Arc::new(RateLimiter::new(config.kube_api_qps, config.kube_api_burst)),
    );

    let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
        None => Arc::new(KubeCheckpointStore::new(ctx.clone())),
    };

    let cluster = Arc::new(RwLock::new(ClusterState::new(Arc::new(
        config.aggregations(),
    ))));

    let feeder = ClusterStateFeeder::new(
        cluster.clone(),
        Arc::new(KubeClusterSource::new(ctx.clone())),
        Arc::new(KubeMetricsSource::new(ctx.clone())),
        checkpoints.clone(),
        config.feeder(),
    );

    let strategy = match config.storage {
        StorageMode::Checkpoint => InitializationStrategy::Checkpoint,
        StorageMode::Prometheus => InitializationStrategy::HistoricalBackfill(Arc::new(
            PrometheusHistoryProvider::new(config.history()?)?,
        )),
    };
    logger.log_startup(RECOMMENDER_VERSION, strategy.name());

    // A failed backfill leaves nothing to recommend from; give up.
    let init = feeder
        .init(&strategy)
        .await
        .context("Failed to initialize cluster state")?;
    info!(
        restored = init.restored_aggregates,
        failed = init.failed_checkpoints,
        history_samples = init.history_samples.applied,
        "Cluster state initialized"
    );

    let status_writer =
        StatusWriter::new(Arc::new(KubeStatusSink::new(ctx.clone()))).with_logger(logger.clone());
    let recommender = Recommender::new(
        feeder,
        PodResourceRecommender::new(RecommenderParams::default()),
        PostProcessorChain::new(config.cpu_integer_post_processor_enabled),
        status_writer,
        health_registry.clone(),
        RunOnceConfig::default(),
    )
    .with_logger(logger.clone());

    let writer = CheckpointWriterRoutine::new(
        CheckpointWriter::new(cluster.clone(), checkpoints.clone(), config.checkpoint_writer()),
        health_registry.clone(),
    );
    let gc = CheckpointGcRoutine::new(
        CheckpointGarbageCollector::new(cluster.clone(), checkpoints.clone())
            .with_logger(logger.clone())
            .with_namespace(config.namespace_scope()),
        health_registry.clone(),
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        cluster.clone(),
        checkpoints.clone(),
    ));

    health_registry.set_ready(true).await;

    // Start health, metrics and recommendation API server
    let api_address = config.address.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_address, app_state).await {
            error!(error = %e, "API server stopped");
        }
    });

    let recommender_interval = config.recommender_interval();
    let write_interval = Duration::from_secs(config.checkpoints_write_interval_secs);
    let gc_interval = Duration::from_secs(config.checkpoints_gc_interval_secs);

    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = vec![
        tokio::spawn({
            let shutdown = shutdown_tx.subscribe();
            async move {
                run_periodically(recommender, recommender_interval, shutdown).await;
            }
        }),
        tokio::spawn({
            let shutdown = shutdown_tx.subscribe();
            async move {
                run_periodically(writer, write_interval, shutdown).await;
            }
        }),
        tokio::spawn({
            let shutdown = shutdown_tx.subscribe();
            async move {
                run_periodically(gc, gc_interval, shutdown).await;
            }
        }),
    ];

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Routine task failed");
        }
    }
    info!("Shutdown complete");

    Ok(())
}
