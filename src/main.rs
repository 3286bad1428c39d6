//! Reqlog demo server - Entry Point
//!
//! Serves the news demo API behind the request logging filter, with graceful
//! shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use reqlog::api::ApiServer;
use reqlog::{telemetry, Config, ReqlogError, TaskExecutor};

#[tokio::main]
async fn main() -> reqlog::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    telemetry::init_tracing(&config.log)?;
    info!("Starting reqlog demo server");

    let executor = Arc::new(TaskExecutor::new(&config.executor)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_server = ApiServer::new(&config, executor.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(shutdown_rx).await {
            error!("API server error: {}", e);
        }
    });

    info!("Server started - API: {}", config.api_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = api_task.await;

    // Joining the workers blocks
    tokio::task::spawn_blocking(move || executor.shutdown())
        .await
        .map_err(|e| ReqlogError::Internal(e.to_string()))?;

    info!("Reqlog demo server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
