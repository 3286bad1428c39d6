use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::capture::CaptureError;

/// Unified error type for the request logging crate
#[derive(Error, Debug)]
pub enum ReqlogError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Body capture / replay errors
    #[error("Body capture failed: {0}")]
    BodyCapture(#[from] CaptureError),

    // Async dispatch errors
    #[error("Async task was dropped before producing a result")]
    AsyncTaskDropped,

    #[error("Task executor is shut down")]
    ExecutorClosed,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Business errors raised by application handlers
    #[error("Business error: {0}")]
    Business(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for reqlog operations
pub type Result<T> = std::result::Result<T, ReqlogError>;

impl ReqlogError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ReqlogError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 422 Unprocessable Entity
            ReqlogError::Business(_) => StatusCode::UNPROCESSABLE_ENTITY,

            // 503 Service Unavailable
            ReqlogError::ExecutorClosed => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ReqlogError::InvalidConfig(_)
            | ReqlogError::BodyCapture(_)
            | ReqlogError::AsyncTaskDropped
            | ReqlogError::Io(_)
            | ReqlogError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for ReqlogError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
