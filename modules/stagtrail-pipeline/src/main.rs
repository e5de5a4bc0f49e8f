use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inference_client::ModelRegistry;
use stagtrail_common::Config;
use stagtrail_pipeline::{run_pool, PgQueue, PgStore, QueueKind, RunStats, WorkerDeps};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagtrail=info")),
        )
        .init();

    info!("Stagtrail pipeline starting...");

    let config = Config::pipeline_from_env();
    config.log_summary();

    let pool = stagtrail_db::connect(&config.database_url).await?;
    stagtrail_db::migrate(&pool).await?;
    info!("Migrations complete");

    // Bring the engines up before taking any work; a missing model refuses
    // startup instead of dead-lettering the backlog.
    let registry = ModelRegistry::new(
        &config.inference_url,
        config.settings.inference_slots,
        &config.detector_model,
        &config.embedder_model,
        config.aux_embedder_model.as_deref(),
        &config.embedding_version,
    );
    let detector = registry.detector().await?;
    let embedder = registry.embedder().await?;
    let aux_embedder = registry.aux_embedder().await?;
    info!("Inference engines ready");

    let stats = Arc::new(RunStats::default());
    let deps = Arc::new(WorkerDeps {
        store: Arc::new(PgStore::new(pool.clone())),
        queue: Arc::new(PgQueue::new(pool.clone(), config.settings.max_retries)),
        detector,
        embedder,
        aux_embedder,
        settings: config.settings.clone(),
        stats: stats.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let detect_pool = tokio::spawn(run_pool(
        QueueKind::Detect,
        deps.clone(),
        shutdown_rx.clone(),
    ));
    let reid_pool = tokio::spawn(run_pool(QueueKind::Reid, deps.clone(), shutdown_rx.clone()));

    let progress_stats = stats.clone();
    let mut progress_shutdown = shutdown_rx.clone();
    let progress = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                    info!("{progress_stats}");
                }
                _ = progress_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    shutdown_tx.send(true)?;

    let _ = detect_pool.await;
    let _ = reid_pool.await;
    progress.abort();

    info!("Pipeline stopped. {stats}");
    Ok(())
}
