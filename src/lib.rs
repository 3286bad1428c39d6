//! Reqlog - structured HTTP request/response logging
//!
//! A tower middleware for axum services that logs every request as a pair of
//! structured records, before and after it is handled, correlated by a
//! per-request id.
//!
//! ## Features
//!
//! - Request and response bodies captured without disturbing the handler
//! - Header redaction and payload truncation
//! - Correlation id carried over to background jobs on the task executor
//! - Requests completing asynchronously logged once, with their final response

pub mod api;
pub mod capture;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod filter;
pub mod models;
pub mod services;
pub mod sink;
pub mod snapshot;
pub mod telemetry;

pub use config::{Config, HeaderVisibility, RequestLoggingConfig};
pub use correlation::CorrelationContext;
pub use error::{ReqlogError, Result};
pub use executor::TaskExecutor;
pub use filter::RequestLoggingLayer;
pub use sink::{SnapshotSink, TracingSink};
