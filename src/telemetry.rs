//! Tracing bootstrap and tagged business records

use std::fmt;

use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{ReqlogError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("reqlog={},tower_http=debug", config.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format.as_str() {
        "pretty" => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    installed.map_err(|e| ReqlogError::Internal(format!("failed to install tracing: {}", e)))
}

/// Category of a business record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    /// Calls out to downstream gateways
    Gateway,
    /// Work running on the task executor
    AsyncJob,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Gateway => "GATEWAY",
            Tag::AsyncJob => "ASYNC_JOB",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload logged under a [`Tag`]
#[derive(Debug, Clone, Serialize)]
pub struct LogData<T> {
    pub message_tag: Tag,
    pub data: T,
}

impl<T: Serialize> LogData<T> {
    pub fn new(message_tag: Tag, data: T) -> Self {
        Self { message_tag, data }
    }

    /// Record serialized for the `data` log field
    pub fn data_json(&self) -> String {
        serde_json::to_string(&self.data).unwrap_or_else(|_| "null".to_string())
    }

    /// Emit as an info event on target `reqlog::business`
    pub fn emit(&self, message: &str) {
        info!(
            target: "reqlog::business",
            message_tag = %self.message_tag,
            data = %self.data_json(),
            "{}",
            message
        );
    }
}
