use saveos_server::archive::{CommandRunner, ScriptedRunner, SystemRunner};
use saveos_server::config::AppConfig;
use saveos_server::db;
use saveos_server::routes;
use saveos_server::services::dispatcher::Dispatcher;
use saveos_server::services::reconciler::{self, Reconciler};
use saveos_server::services::worker;
use saveos_server::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging; RUST_LOG wins over LOG_LEVEL
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting SaveOS server on port {}", config.port);

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.repos_dir)?;

    // Initialize database
    let pool = db::create_pool(&config.db_path)?;
    db::migrate(&pool)?;

    let archive: Arc<dyn CommandRunner> = if config.archive_simulation {
        tracing::warn!("ARCHIVE_SIMULATION is on: archive commands are simulated");
        Arc::new(ScriptedRunner::simulated())
    } else {
        Arc::new(SystemRunner)
    };
    if config.default_passphrase.is_none() {
        tracing::warn!("BORG_DEFAULT_PASSPHRASE is not set; backups need a passphrase in their job config");
    }

    // Build application state
    let (dispatcher, rx) = Dispatcher::new(config.queue_capacity);
    let state = Arc::new(AppState::new(pool, config.clone(), dispatcher, archive));

    // Start worker pool
    let cancel = CancellationToken::new();
    let workers = worker::start_workers(state.clone(), rx, cancel.clone());
    tracing::info!(count = workers.len(), "Workers started");

    match reconciler::recover_pending(&state).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "Re-enqueued pending jobs"),
        Err(e) => tracing::warn!("Failed to re-enqueue pending jobs: {}", e),
    }

    // Lease reconciliation
    let reconciler = match Reconciler::new(state.clone()).await {
        Ok(r) => match r.start().await {
            Ok(()) => Some(r),
            Err(e) => {
                tracing::warn!("Failed to start reconciler: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to create reconciler: {}", e);
            None
        }
    };

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(r) = reconciler {
        if let Err(e) = r.shutdown().await {
            tracing::warn!("Reconciler shutdown error: {}", e);
        }
    }

    // Workers finish the job in hand; anything still running after the
    // drain timeout is picked up by reconciliation on next start.
    let drain = join_workers(workers);
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Workers did not stop within {:?}", WORKER_DRAIN_TIMEOUT);
    }

    // Close database
    db::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn join_workers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("Worker task ended abnormally: {}", e);
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
