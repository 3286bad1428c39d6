//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::{ApiServerConfig, Config};
use crate::error::{ReqlogError, Result};
use crate::executor::TaskExecutor;
use crate::filter::RequestLoggingLayer;
use crate::services::NewsService;
use crate::sink::TracingSink;

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub news: NewsService,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    logging: RequestLoggingLayer,
}

impl ApiServer {
    /// Create a new API server logging through `tracing`
    pub fn new(config: &Config, executor: Arc<TaskExecutor>) -> Self {
        Self::with_logging(
            config,
            executor,
            RequestLoggingLayer::new(config.logging.clone(), TracingSink),
        )
    }

    /// Create a new API server with a custom logging layer
    pub fn with_logging(
        config: &Config,
        executor: Arc<TaskExecutor>,
        logging: RequestLoggingLayer,
    ) -> Self {
        let news = NewsService::new(
            executor,
            Duration::from_millis(config.api.async_delay_max_ms),
        );

        Self {
            config: config.api.clone(),
            state: AppState {
                news,
                started_at: Instant::now(),
            },
            logging,
        }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone(), self.logging.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| ReqlogError::InvalidConfig(format!("Invalid API server address: {}", e)))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| ReqlogError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
