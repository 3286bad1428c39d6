//! Structured request/response snapshots
//!
//! Pure functions turning the state of a request (and its response) into the
//! flat field sets emitted by the logging filter. Field names are part of the
//! output schema consumed by log pipelines and must not change.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use bytes::Bytes;
use encoding_rs::Encoding;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::capture::{CachedResponse, RequestBodyCache};
use crate::config::{HeaderVisibility, RequestLoggingConfig};

/// Marker substituted for values that must not be logged
pub const REDACTED: &str = "[redacted]";

/// Error type for snapshot construction
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Request start time was not recorded")]
    MissingStartTime,

    #[error("Unsupported character encoding: {0}")]
    UnsupportedCharset(String),
}

/// Instant at which the logging filter handed the request downstream
#[derive(Clone, Copy, Debug)]
pub struct RequestStartedAt(pub Instant);

impl RequestStartedAt {
    pub fn now() -> Self {
        Self(Instant::now())
    }
}

/// Session attached to the request by upstream middleware.
///
/// Reading it never creates one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Remote user authenticated by upstream middleware
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// The parts of a request a snapshot is built from.
///
/// Taken before the request is handed downstream, since the handler consumes
/// the request itself.
#[derive(Clone, Debug)]
pub struct RequestView {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub session: Option<Session>,
    pub user: Option<AuthenticatedUser>,
    pub body: Option<RequestBodyCache>,
    pub started_at: Option<RequestStartedAt>,
}

impl RequestView {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let extensions = request.extensions();
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            remote_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            session: extensions.get::<Session>().cloned(),
            user: extensions.get::<AuthenticatedUser>().cloned(),
            body: extensions.get::<RequestBodyCache>().cloned(),
            started_at: extensions.get::<RequestStartedAt>().copied(),
        }
    }
}

/// The parts of a response a snapshot is built from
#[derive(Clone, Debug)]
pub struct ResponseView {
    pub status: StatusCode,
    /// Buffered body, `None` when the response was not captured
    pub content: Option<Bytes>,
}

impl ResponseView {
    /// A response whose body was not buffered
    pub fn uncaptured(status: StatusCode) -> Self {
        Self {
            status,
            content: None,
        }
    }
}

impl From<&CachedResponse> for ResponseView {
    fn from(response: &CachedResponse) -> Self {
        Self {
            status: response.status(),
            content: Some(response.content().clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub request_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSnapshot {
    #[serde(flatten)]
    pub request: RequestSnapshot,
    pub response_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Milliseconds since the request was handed downstream
    pub duration: u64,
}

impl RequestSnapshot {
    /// Snapshot as a flat field map
    pub fn to_map(&self) -> Map<String, Value> {
        to_map(self)
    }
}

impl ResponseSnapshot {
    /// Snapshot as a flat field map
    pub fn to_map(&self) -> Map<String, Value> {
        to_map(self)
    }
}

fn to_map<T: Serialize>(snapshot: &T) -> Map<String, Value> {
    match serde_json::to_value(snapshot) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Build the snapshot logged before a request is handled
pub fn build_request_snapshot(
    request: &RequestView,
    config: &RequestLoggingConfig,
) -> RequestSnapshot {
    let request_uri = request.uri.path().to_string();

    let full_uri = if config.include_query_string {
        request
            .uri
            .query()
            .map(|query| format!("{}?{}", request_uri, query))
    } else {
        None
    };

    let (client, session_id, user) = if config.include_client_info {
        (
            request
                .remote_addr
                .map(|addr| addr.ip().to_string())
                .filter(|client| !client.is_empty()),
            request.session.as_ref().map(|s| s.id().to_string()),
            request.user.as_ref().map(|u| u.0.clone()),
        )
    } else {
        (None, None, None)
    };

    let headers = config
        .include_headers
        .then(|| header_fields(&request.headers, &config.header_visibility));

    let request_body = if config.include_payload {
        request_payload(request.body.as_ref(), config.max_payload_length)
    } else {
        Some(REDACTED.to_string())
    };

    RequestSnapshot {
        method: request.method.to_string(),
        request_uri,
        full_uri,
        client,
        session_id,
        user,
        headers,
        request_body,
    }
}

/// Build the snapshot logged once the response is final
pub fn build_response_snapshot(
    request: &RequestView,
    response: &ResponseView,
    config: &RequestLoggingConfig,
) -> Result<ResponseSnapshot, SnapshotError> {
    let started_at = request.started_at.ok_or(SnapshotError::MissingStartTime)?;

    let response_body = if config.include_payload {
        response
            .content
            .as_ref()
            .filter(|content| !content.is_empty())
            .map(|content| {
                let length = content.len().min(config.max_payload_length);
                // Response bodies are assumed to be UTF-8 whatever they declare
                String::from_utf8_lossy(&content[..length]).into_owned()
            })
    } else {
        Some(REDACTED.to_string())
    };

    Ok(ResponseSnapshot {
        request: build_request_snapshot(request, config),
        response_code: response.status.as_u16(),
        response_body,
        duration: started_at.0.elapsed().as_millis() as u64,
    })
}

fn header_fields(headers: &HeaderMap, visibility: &HeaderVisibility) -> BTreeMap<String, String> {
    headers
        .keys()
        .map(|name| {
            let value = if visibility.is_visible(name.as_str()) {
                headers
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                REDACTED.to_string()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

fn request_payload(cache: Option<&RequestBodyCache>, max_length: usize) -> Option<String> {
    let cache = cache?;
    let content = cache.content();
    if content.is_empty() {
        return None;
    }

    let length = content.len().min(max_length);
    match decode(&content[..length], cache.charset()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            debug!(error = %e, "Request payload omitted from log");
            None
        }
    }
}

/// Decode bytes using a declared charset; UTF-8 when none is declared.
///
/// Labels are resolved as browsers resolve them, so `iso-8859-1` and
/// `us-ascii` decode as windows-1252. Underscored aliases such as
/// `ISO_8859_1` are accepted as well.
fn decode(bytes: &[u8], charset: Option<&str>) -> Result<String, SnapshotError> {
    let label = charset.unwrap_or("utf-8");
    let encoding = Encoding::for_label(label.as_bytes())
        .or_else(|| Encoding::for_label(label.replace('_', "-").as_bytes()))
        .ok_or_else(|| SnapshotError::UnsupportedCharset(label.to_string()))?;

    let (text, _) = encoding.decode_without_bom_handling(bytes);
    Ok(text.into_owned())
}
