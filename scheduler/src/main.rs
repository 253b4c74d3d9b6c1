// Scheduler binary entry point

mod runner;

use anyhow::Context;
use common::cluster::{router, ConfirmationHandler, HttpConfirmationClient};
use common::config::Settings;
use common::db::DbPool;
use common::persistence::PgStatusRepository;
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerEngine};
use common::source::{DefaultJobFactory, PgJobConfigSource};
use common::store::{ClusteredJobStore, StoreOptions};
use common::telemetry::{init_logging, init_metrics, shutdown_tracer};
use common::worker::{ElasticWorkerPool, PoolOptions};
use runner::LoggingJobRunner;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    init_metrics(settings.observability.metrics_port)?;

    info!(
        node_id = %settings.node.node_id,
        scheduler_name = %settings.node.scheduler_name,
        listen_addr = %settings.cluster.listen_addr,
        peers = settings.cluster.peers.len(),
        "Starting clustered job scheduler"
    );

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;

    let repository = PgStatusRepository::new(db_pool.clone(), &settings.database.status_table)?;
    repository.ensure_schema().await?;
    let source = PgJobConfigSource::new(db_pool.clone(), &settings.database.job_config_table)?;
    let confirmation = HttpConfirmationClient::from_config(&settings.cluster)?;

    let store = Arc::new(ClusteredJobStore::new(
        StoreOptions::from_settings(&settings),
        Arc::new(repository),
        Arc::new(source),
        Arc::new(DefaultJobFactory),
        Arc::new(confirmation),
    ));

    // Peers may ask about our triggers as soon as the first load writes them
    let (server_shutdown_tx, _) = broadcast::channel::<()>(1);
    let server = spawn_confirmation_server(
        &settings.cluster.listen_addr,
        ConfirmationHandler::new(Arc::clone(&store)),
        server_shutdown_tx.subscribe(),
    )
    .await?;

    store.start().await.context("Failed to initialize job store")?;
    info!("Job store initialized");

    let pool = Arc::new(ElasticWorkerPool::new(PoolOptions::from_config(
        "scheduler",
        &settings.pool,
    )));
    let engine = Arc::new(SchedulerEngine::new(
        SchedulerConfig::from_config(&settings.engine),
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::new(LoggingJobRunner),
    ));

    let engine_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = engine.start().await {
                error!(error = %e, "Scheduler engine error");
            }
        })
    };

    wait_for_shutdown(&store).await;
    info!("Initiating graceful shutdown");

    if let Err(e) = engine.stop().await {
        error!(error = %e, "Error stopping scheduler engine");
    }
    if let Err(e) = engine_task.await {
        error!(error = %e, "Scheduler engine task failed");
    }

    let draining = Arc::clone(&pool);
    if let Err(e) = tokio::task::spawn_blocking(move || draining.shutdown(true)).await {
        error!(error = %e, "Worker pool shutdown failed");
    }

    store.shutdown().await;

    let _ = server_shutdown_tx.send(());
    if let Err(e) = server.await {
        warn!(error = %e, "Confirmation server task failed");
    }

    db_pool.close().await;
    shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}

/// Serve the execution confirmation endpoint until the shutdown signal fires
async fn spawn_confirmation_server(
    listen_addr: &str,
    handler: ConfirmationHandler,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind confirmation endpoint on {}", listen_addr))?;
    info!(addr = %listen_addr, "Confirmation endpoint listening");

    let app = router(handler);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Confirmation endpoint failed");
        }
    }))
}

/// Block until SIGINT/SIGTERM. SIGHUP is the membership-change hook and
/// schedules a cluster reconciliation instead.
#[cfg(unix)]
async fn wait_for_shutdown(store: &Arc<ClusteredJobStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(hangup), Ok(terminate)) => (hangup, terminate),
        _ => {
            warn!("Failed to install unix signal handlers, falling back to Ctrl+C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, scheduling cluster reconciliation");
                store.cluster_topology_changed();
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Received Ctrl+C");
                return;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_store: &Arc<ClusteredJobStore>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
}
