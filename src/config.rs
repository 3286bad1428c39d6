use std::env;
use std::fmt;
use std::sync::Arc;

use crate::error::{ReqlogError, Result};

/// Default number of payload bytes included in a logged body
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 50;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Request logging filter configuration
    pub logging: RequestLoggingConfig,
    /// Background task executor configuration
    pub executor: ExecutorConfig,
    /// Logging output configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Upper bound of the simulated work in the async demo endpoint, in ms
    pub async_delay_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads (default: 3)
    pub workers: usize,
    /// Worker thread name prefix (default: "Task-")
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            thread_name_prefix: "Task-".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

/// Predicate deciding whether a header value may be logged as-is.
pub type HeaderPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Header visibility policy.
///
/// Headers whose name fails the predicate are logged with a redaction
/// marker instead of their value. Without a predicate every header is
/// visible.
#[derive(Clone, Default)]
pub struct HeaderVisibility {
    predicate: Option<HeaderPredicate>,
}

impl HeaderVisibility {
    /// Every header is logged verbatim
    pub fn all() -> Self {
        Self::default()
    }

    /// Use a custom predicate over lowercase header names
    pub fn new(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Only the listed header names are visible (case-insensitive)
    pub fn allow_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed: Vec<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        Self::new(move |name| allowed.iter().any(|a| a.eq_ignore_ascii_case(name)))
    }

    /// Whether a predicate is configured
    pub fn is_restricted(&self) -> bool {
        self.predicate.is_some()
    }

    /// Check whether the named header may be logged verbatim
    pub fn is_visible(&self, name: &str) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(name),
            None => true,
        }
    }
}

impl fmt::Debug for HeaderVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderVisibility")
            .field("restricted", &self.is_restricted())
            .finish()
    }
}

/// Configuration for the request logging filter.
///
/// Applied once when the layer is built and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RequestLoggingConfig {
    /// Append the query string as `full_uri`
    pub include_query_string: bool,
    /// Include client address, session id and authenticated user
    pub include_client_info: bool,
    /// Include request headers
    pub include_headers: bool,
    /// Include request and response bodies
    pub include_payload: bool,
    /// Maximum number of body bytes included in a logged payload
    pub max_payload_length: usize,
    /// Emit a record before the request is handled
    pub should_log_before: bool,
    /// Emit a record after the response is produced
    pub should_log_after: bool,
    /// Which headers are logged verbatim
    pub header_visibility: HeaderVisibility,
}

impl Default for RequestLoggingConfig {
    fn default() -> Self {
        Self {
            include_query_string: false,
            include_client_info: false,
            include_headers: false,
            include_payload: false,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            should_log_before: true,
            should_log_after: true,
            header_visibility: HeaderVisibility::all(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8080").parse().map_err(|_| {
                    ReqlogError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                async_delay_max_ms: get_env_or("ASYNC_DELAY_MAX_MS", "5000")
                    .parse()
                    .map_err(|_| {
                        ReqlogError::InvalidConfig(
                            "ASYNC_DELAY_MAX_MS must be a non-negative number".into(),
                        )
                    })?,
            },
            logging: RequestLoggingConfig {
                include_query_string: get_bool_or("REQLOG_INCLUDE_QUERY_STRING", true),
                include_client_info: get_bool_or("REQLOG_INCLUDE_CLIENT_INFO", true),
                include_headers: get_bool_or("REQLOG_INCLUDE_HEADERS", true),
                include_payload: get_bool_or("REQLOG_INCLUDE_PAYLOAD", true),
                max_payload_length: get_env_or("REQLOG_MAX_PAYLOAD_LENGTH", "2048")
                    .parse()
                    .map_err(|_| {
                        ReqlogError::InvalidConfig(
                            "REQLOG_MAX_PAYLOAD_LENGTH must be a non-negative number".into(),
                        )
                    })?,
                should_log_before: get_bool_or("REQLOG_LOG_BEFORE", true),
                should_log_after: get_bool_or("REQLOG_LOG_AFTER", true),
                header_visibility: parse_visible_headers(&get_env_or(
                    "REQLOG_VISIBLE_HEADERS",
                    "user-agent,host,accept-encoding",
                )),
            },
            executor: ExecutorConfig {
                workers: parse_workers(&get_env_or("TASK_WORKERS", "3"))?,
                thread_name_prefix: get_env_or("TASK_THREAD_PREFIX", "Task-"),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_visible_headers(raw: &str) -> HeaderVisibility {
    if raw.trim().is_empty() {
        return HeaderVisibility::all();
    }
    HeaderVisibility::allow_list(raw.split(','))
}

fn parse_workers(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ReqlogError::InvalidConfig(
            "TASK_WORKERS must be a positive number".into(),
        )),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_bool_or(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
