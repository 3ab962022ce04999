//! Beacon dispatch worker binary entrypoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_engine::{JobProcessor, PgStore, ProcessorOptions};
use beacon_notifier::PushGateway;
use beacon_notifier::auth::{AccessTokenProvider, ServiceAccountKey};
use beacon_notifier::dry_run::DryRunGateway;
use beacon_notifier::fcm::FcmGateway;

use beacon_worker::intake::{Intake, Sweeper};
use beacon_worker::queue::{WorkQueue, spawn_workers};
use beacon_worker::routes::create_router;
use beacon_worker::state::AppState;
use beacon_worker::stats::WorkerStats;

/// How long in-flight jobs get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "beacon_worker=info,beacon_engine=info,beacon_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Beacon dispatch worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    config.validate()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let gateway = build_gateway(&config)?;
    let gateway_name = gateway.name();

    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        store.clone(),
        gateway,
        ProcessorOptions::from_config(&config),
    ));

    let stats = Arc::new(WorkerStats::new());
    let (queue, receiver) = WorkQueue::new(config.queue_capacity, stats.clone());
    let shutdown = CancellationToken::new();
    let mut workers = spawn_workers(
        config.worker_concurrency,
        receiver,
        processor,
        stats.clone(),
        shutdown.clone(),
    );
    tracing::info!(
        workers = config.worker_concurrency,
        queue_capacity = config.queue_capacity,
        gateway = gateway_name,
        "Worker pool started"
    );

    let intake = Intake::new(store.clone(), queue.clone(), config.intake_page_size);
    let sweeper = Sweeper::new(store.clone(), queue.clone(), stats.clone(), &config);

    let state = AppState::new(store, queue, stats, gateway_name);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.health_addr)
        .await
        .with_context(|| format!("binding health endpoint on {}", config.health_addr))?;
    tracing::info!(addr = %config.health_addr, "Health endpoint listening");

    // Run with graceful shutdown on Ctrl+C / SIGTERM
    tokio::select! {
        result = intake.run(&pool) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Intake exited with error");
                return Err(e);
            }
        }
        _ = sweeper.run() => {}
        result = async { axum::serve(listener, app).await } => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Health server exited with error");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    // Open health connections may still hold queue senders, so workers are
    // told to stop rather than waiting for the queue to close.
    shutdown.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Shutdown grace period elapsed, abandoning in-flight jobs to recovery");
        workers.abort_all();
    }

    tracing::info!("Beacon dispatch worker stopped.");
    Ok(())
}

fn build_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn PushGateway>> {
    if config.dry_run {
        tracing::warn!("Dry-run mode: notifications are logged, not sent");
        return Ok(Arc::new(DryRunGateway::new()));
    }

    let path = config
        .fcm_credentials_path
        .as_deref()
        .context("FCM_CREDENTIALS_PATH is required unless DISPATCH_DRY_RUN is set")?;
    let key = ServiceAccountKey::from_file(path)?;

    let project_id = config
        .fcm_project_id
        .clone()
        .or_else(|| key.project_id.clone())
        .context("FCM project id missing: set FCM_PROJECT_ID or use a key with project_id")?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let auth = AccessTokenProvider::new(key, client.clone());

    Ok(Arc::new(FcmGateway::new(
        client,
        auth,
        &config.fcm_endpoint,
        &project_id,
        config.fcm_request_concurrency,
    )))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
