//! News demo endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use tracing::{error, info};

use crate::api::server::AppState;
use crate::dispatch::RequestLifecycle;
use crate::error::{ReqlogError, Result};
use crate::models::{FakeNews, FakeNewsRequest};

pub async fn get_news(State(state): State<AppState>) -> Json<FakeNews> {
    Json(state.news.get_fake_news())
}

pub async fn create_news(Json(request): Json<FakeNewsRequest>) -> Json<FakeNewsRequest> {
    info!("Create new fake news");
    Json(request)
}

/// Logs a failure chain and still answers 200 with an empty body
pub async fn get_news_but_exception() {
    let cause = ReqlogError::InvalidRequest("Incorrect news id".into());
    let err = ReqlogError::Business(format!("Internal server error: {}", cause));
    error!(error = %err, cause = %cause, "Error getting news");
}

/// Fire two background jobs and return immediately
pub async fn fake_async_tracing(State(state): State<AppState>) -> Result<()> {
    let jobs = 2;
    for id in 0..jobs {
        state.news.some_async_job(id)?;
    }
    state.news.spawn_audit(jobs);
    Ok(())
}

/// Suspend the request; the greeting job produces the final response
pub async fn async_controller(
    State(state): State<AppState>,
    Extension(lifecycle): Extension<Arc<RequestLifecycle>>,
) -> Result<StatusCode> {
    lifecycle.start_async(state.news.executor(), state.news.greeting_job())?;
    Ok(StatusCode::ACCEPTED)
}
