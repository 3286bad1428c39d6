//! API route definitions

use axum::routing::get;
use axum::Router;

use crate::dispatch::{AsyncDispatchLayer, AsyncResultLayer};
use crate::filter::RequestLoggingLayer;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes.
///
/// Every route runs behind the logging filter, itself wrapped by the async
/// dispatch layers so that suspended requests re-enter it.
pub fn create_router(state: AppState, logging: RequestLoggingLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/news",
            get(handlers::news::get_news).post(handlers::news::create_news),
        )
        .route("/news/exception", get(handlers::news::get_news_but_exception))
        .route("/news/async", get(handlers::news::fake_async_tracing))
        .route(
            "/news/async-controller",
            get(handlers::news::async_controller),
        )
        .with_state(state)
        .layer(AsyncResultLayer)
        .layer(logging)
        .layer(AsyncDispatchLayer)
}
