//! Destinations for request/response snapshots

use parking_lot::Mutex;
use tracing::info;

use crate::correlation::CorrelationContext;
use crate::snapshot::{RequestSnapshot, ResponseSnapshot};

/// Receives the snapshots produced by the logging filter.
///
/// Called on the request's task, inside its correlation scope.
pub trait SnapshotSink: Send + Sync + 'static {
    fn before(&self, snapshot: &RequestSnapshot);

    fn after(&self, snapshot: &ResponseSnapshot);
}

/// Emits snapshots as structured `tracing` events on target `reqlog::http`.
///
/// Scalar snapshot fields become event fields. The header map is recorded
/// as a single `headers` field holding its JSON encoding, since `tracing`
/// field values cannot be nested maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl SnapshotSink for TracingSink {
    fn before(&self, snapshot: &RequestSnapshot) {
        info!(
            target: "reqlog::http",
            method = %snapshot.method,
            request_uri = %snapshot.request_uri,
            full_uri = snapshot.full_uri.as_deref(),
            client = snapshot.client.as_deref(),
            session_id = snapshot.session_id.as_deref(),
            user = snapshot.user.as_deref(),
            headers = headers_field(&snapshot.headers).as_deref(),
            request_body = snapshot.request_body.as_deref(),
            "START request"
        );
    }

    fn after(&self, snapshot: &ResponseSnapshot) {
        let request = &snapshot.request;
        info!(
            target: "reqlog::http",
            method = %request.method,
            request_uri = %request.request_uri,
            full_uri = request.full_uri.as_deref(),
            client = request.client.as_deref(),
            session_id = request.session_id.as_deref(),
            user = request.user.as_deref(),
            headers = headers_field(&request.headers).as_deref(),
            request_body = request.request_body.as_deref(),
            response_code = snapshot.response_code,
            response_body = snapshot.response_body.as_deref(),
            duration = snapshot.duration,
            "type" = "HTTP_REQUEST",
            "END request"
        );
    }
}

fn headers_field(
    headers: &Option<std::collections::BTreeMap<String, String>>,
) -> Option<String> {
    headers
        .as_ref()
        .and_then(|headers| serde_json::to_string(headers).ok())
}

/// One snapshot captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Before {
        snapshot: RequestSnapshot,
        request_id: Option<String>,
    },
    After {
        snapshot: ResponseSnapshot,
        request_id: Option<String>,
    },
}

impl Recorded {
    /// Request id active when the snapshot was emitted
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Recorded::Before { request_id, .. } | Recorded::After { request_id, .. } => {
                request_id.as_deref()
            }
        }
    }

    pub fn is_before(&self) -> bool {
        matches!(self, Recorded::Before { .. })
    }
}

/// Keeps every snapshot in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Recorded> {
        self.records.lock().clone()
    }

    pub fn before_snapshots(&self) -> Vec<RequestSnapshot> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Before { snapshot, .. } => Some(snapshot.clone()),
                Recorded::After { .. } => None,
            })
            .collect()
    }

    pub fn after_snapshots(&self) -> Vec<ResponseSnapshot> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::After { snapshot, .. } => Some(snapshot.clone()),
                Recorded::Before { .. } => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

fn current_request_id() -> Option<String> {
    CorrelationContext::current().and_then(|ctx| ctx.request_id().map(str::to_string))
}

impl SnapshotSink for RecordingSink {
    fn before(&self, snapshot: &RequestSnapshot) {
        self.records.lock().push(Recorded::Before {
            snapshot: snapshot.clone(),
            request_id: current_request_id(),
        });
    }

    fn after(&self, snapshot: &ResponseSnapshot) {
        self.records.lock().push(Recorded::After {
            snapshot: snapshot.clone(),
            request_id: current_request_id(),
        });
    }
}

impl<T: SnapshotSink> SnapshotSink for std::sync::Arc<T> {
    fn before(&self, snapshot: &RequestSnapshot) {
        (**self).before(snapshot)
    }

    fn after(&self, snapshot: &ResponseSnapshot) {
        (**self).after(snapshot)
    }
}
