//! Request logging middleware
//!
//! [`RequestLoggingLayer`] wraps a service so that every request is logged
//! twice: a "before" snapshot when it enters and an "after" snapshot once its
//! response is final. Each invocation runs inside its own correlation scope.
//!
//! A request suspended into async processing is not logged "after" on its
//! original dispatch; the async continuation produces that record instead.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tower::{Layer, Service};
use tracing::{debug, error};

use crate::capture::{CachedResponse, RequestBodyCache};
use crate::config::RequestLoggingConfig;
use crate::correlation::{self, CorrelationContext};
use crate::dispatch::{DispatchState, RequestLifecycle};
use crate::error::ReqlogError;
use crate::sink::SnapshotSink;
use crate::snapshot::{
    build_request_snapshot, build_response_snapshot, RequestStartedAt, RequestView, ResponseView,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Tower layer adding request/response logging
#[derive(Clone)]
pub struct RequestLoggingLayer {
    config: Arc<RequestLoggingConfig>,
    sink: Arc<dyn SnapshotSink>,
}

impl RequestLoggingLayer {
    pub fn new(config: RequestLoggingConfig, sink: impl SnapshotSink) -> Self {
        Self {
            config: Arc::new(config),
            sink: Arc::new(sink),
        }
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingService {
            inner,
            config: self.config.clone(),
            sink: self.sink.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestLoggingService<S> {
    inner: S,
    config: Arc<RequestLoggingConfig>,
    sink: Arc<dyn SnapshotSink>,
}

impl<S> Service<Request> for RequestLoggingService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The ready service goes with this call, a fresh clone stays behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let filter = Filter {
            config: self.config.clone(),
            sink: self.sink.clone(),
        };

        // Every physical invocation gets its own id, continuations included
        let ctx = CorrelationContext::begin();
        Box::pin(correlation::scope(ctx, filter.process(inner, request)))
    }
}

struct Filter {
    config: Arc<RequestLoggingConfig>,
    sink: Arc<dyn SnapshotSink>,
}

impl Filter {
    async fn process<S>(self, mut inner: S, mut request: Request) -> Result<Response, S::Error>
    where
        S: Service<Request, Response = Response>,
    {
        let config = &self.config;
        let lifecycle = RequestLifecycle::from_request(&request);
        let state = lifecycle
            .as_ref()
            .map_or(DispatchState::OriginalDispatch, |l| l.state());
        let is_original_dispatch = state != DispatchState::AsyncContinuation;
        debug!(?state, "Request entered logging filter");

        if config.include_payload
            && is_original_dispatch
            && RequestBodyCache::install(&mut request, config.max_payload_length)
        {
            if let (Some(lifecycle), Some(cache)) =
                (&lifecycle, RequestBodyCache::from_request(&request))
            {
                lifecycle.set_attribute(cache.clone());
            }
        }

        let mut view = RequestView::from_request(&request);
        if config.should_log_before {
            self.sink.before(&build_request_snapshot(&view, config));
        }

        let capture_response =
            config.should_log_after && config.include_payload && !is_suspended(&lifecycle);

        let started_at = RequestStartedAt::now();
        request.extensions_mut().insert(started_at);
        view.started_at = Some(started_at);

        // `call` itself may panic before handing back a future
        let outcome = AssertUnwindSafe(async move { inner.call(request).await })
            .catch_unwind()
            .await;

        let suspended = is_suspended(&lifecycle);
        let log_after = config.should_log_after && !suspended;
        if suspended {
            debug!(state = ?DispatchState::AsyncStarted, "Response log deferred to async continuation");
        } else {
            debug!(state = ?DispatchState::Complete, "Request left logging filter");
        }

        match outcome {
            Ok(Ok(response)) => {
                if !log_after {
                    return Ok(response);
                }
                if capture_response && !CachedResponse::is_captured(&response) {
                    Ok(self.capture_and_log(&view, response).await)
                } else {
                    self.log_after(&view, &ResponseView::uncaptured(response.status()));
                    Ok(response)
                }
            }
            Ok(Err(e)) => {
                if log_after {
                    self.log_after(&view, &ResponseView::uncaptured(StatusCode::INTERNAL_SERVER_ERROR));
                }
                Err(e)
            }
            Err(panic) => {
                if log_after {
                    self.log_after(&view, &ResponseView::uncaptured(StatusCode::INTERNAL_SERVER_ERROR));
                }
                panic::resume_unwind(panic)
            }
        }
    }

    /// Buffer the response, log it and hand the buffered body to the client
    async fn capture_and_log(&self, view: &RequestView, response: Response) -> Response {
        match CachedResponse::capture(response).await {
            Ok(cached) => {
                self.log_after(view, &ResponseView::from(&cached));
                cached.copy_body_to_response()
            }
            Err(e) => {
                let err = ReqlogError::from(e);
                self.log_after(view, &ResponseView::uncaptured(err.status_code()));
                err.into_response()
            }
        }
    }

    fn log_after(&self, view: &RequestView, response: &ResponseView) {
        match build_response_snapshot(view, response, &self.config) {
            Ok(snapshot) => self.sink.after(&snapshot),
            Err(e) => error!(error = %e, "Failed to build response snapshot"),
        }
    }
}

fn is_suspended(lifecycle: &Option<Arc<RequestLifecycle>>) -> bool {
    lifecycle.as_ref().is_some_and(|l| l.is_async_started())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturedMarker;
    use crate::config::{ExecutorConfig, HeaderVisibility};
    use crate::dispatch::{AsyncDispatchLayer, AsyncResultLayer};
    use crate::executor::TaskExecutor;
    use crate::sink::RecordingSink;
    use crate::snapshot::REDACTED;
    use axum::body::Body;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Extension, Router};
    use http_body_util::BodyExt;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn payload_config() -> RequestLoggingConfig {
        RequestLoggingConfig {
            include_query_string: true,
            include_headers: true,
            include_payload: true,
            max_payload_length: 2048,
            ..Default::default()
        }
    }

    async fn echo(body: String) -> String {
        body
    }

    async fn greet() -> &'static str {
        "Hello World !!"
    }

    fn app(config: RequestLoggingConfig, sink: Arc<RecordingSink>) -> Router {
        Router::new()
            .route("/echo", post(echo))
            .route("/greet", get(greet))
            .layer(RequestLoggingLayer::new(config, sink))
    }

    async fn body_of(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_before_and_after_share_request_id() {
        let sink = Arc::new(RecordingSink::new());
        let response = app(payload_config(), sink.clone())
            .oneshot(
                Request::builder()
                    .uri("/greet?a=1&b=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "Hello World !!");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_before());
        assert!(!records[1].is_before());
        assert!(records[0].request_id().is_some());
        assert_eq!(records[0].request_id(), records[1].request_id());

        let before = &sink.before_snapshots()[0];
        assert_eq!(before.method, "GET");
        assert_eq!(before.request_uri, "/greet");
        assert_eq!(before.full_uri.as_deref(), Some("/greet?a=1&b=2"));

        let after = &sink.after_snapshots()[0];
        assert_eq!(after.response_code, 200);
        assert_eq!(after.response_body.as_deref(), Some("Hello World !!"));
    }

    #[tokio::test]
    async fn test_request_body_logged_after_handler_read_it() {
        let sink = Arc::new(RecordingSink::new());
        let response = app(payload_config(), sink.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from("{\"category\":\"sport\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.extensions().get::<CapturedMarker>().is_some());
        assert_eq!(body_of(response).await, "{\"category\":\"sport\"}");

        // Nothing was read yet when the request entered
        assert_eq!(sink.before_snapshots()[0].request_body, None);

        let after = &sink.after_snapshots()[0];
        assert_eq!(
            after.request.request_body.as_deref(),
            Some("{\"category\":\"sport\"}")
        );
        assert_eq!(
            after.response_body.as_deref(),
            Some("{\"category\":\"sport\"}")
        );
    }

    #[tokio::test]
    async fn test_bodies_truncated_but_client_gets_everything() {
        let sink = Arc::new(RecordingSink::new());
        let config = RequestLoggingConfig {
            max_payload_length: 5,
            ..payload_config()
        };
        let response = app(config, sink.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from("abcdefghij"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_of(response).await, "abcdefghij");
        let after = &sink.after_snapshots()[0];
        assert_eq!(after.request.request_body.as_deref(), Some("abcde"));
        assert_eq!(after.response_body.as_deref(), Some("abcde"));
    }

    #[tokio::test]
    async fn test_payload_disabled_redacts_and_skips_capture() {
        let sink = Arc::new(RecordingSink::new());
        let config = RequestLoggingConfig {
            include_payload: false,
            ..payload_config()
        };
        let response = app(config, sink.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from("secret"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.extensions().get::<CapturedMarker>().is_none());
        assert_eq!(body_of(response).await, "secret");

        let after = &sink.after_snapshots()[0];
        assert_eq!(after.request.request_body.as_deref(), Some(REDACTED));
        assert_eq!(after.response_body.as_deref(), Some(REDACTED));
    }

    #[tokio::test]
    async fn test_log_before_and_after_switches() {
        let sink = Arc::new(RecordingSink::new());
        let config = RequestLoggingConfig {
            should_log_before: false,
            ..payload_config()
        };
        app(config, sink.clone())
            .oneshot(Request::builder().uri("/greet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(sink.before_snapshots().len(), 0);
        assert_eq!(sink.after_snapshots().len(), 1);

        let sink = Arc::new(RecordingSink::new());
        let config = RequestLoggingConfig {
            should_log_after: false,
            ..payload_config()
        };
        let response = app(config, sink.clone())
            .oneshot(Request::builder().uri("/greet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.extensions().get::<CapturedMarker>().is_none());
        assert_eq!(sink.before_snapshots().len(), 1);
        assert_eq!(sink.after_snapshots().len(), 0);
    }

    #[tokio::test]
    async fn test_hidden_headers_redacted() {
        let sink = Arc::new(RecordingSink::new());
        let config = RequestLoggingConfig {
            header_visibility: HeaderVisibility::allow_list(["user-agent"]),
            ..payload_config()
        };
        app(config, sink.clone())
            .oneshot(
                Request::builder()
                    .uri("/greet")
                    .header("user-agent", "curl/8.0")
                    .header("authorization", "Bearer token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = sink.before_snapshots()[0].headers.clone().unwrap();
        assert_eq!(headers["user-agent"], "curl/8.0");
        assert_eq!(headers["authorization"], REDACTED);
    }

    #[tokio::test]
    async fn test_stacked_filters_capture_once() {
        let inner_sink = Arc::new(RecordingSink::new());
        let outer_sink = Arc::new(RecordingSink::new());
        let app = Router::new()
            .route("/greet", get(greet))
            .layer(RequestLoggingLayer::new(payload_config(), inner_sink.clone()))
            .layer(RequestLoggingLayer::new(payload_config(), outer_sink.clone()));

        let response = app
            .oneshot(Request::builder().uri("/greet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "Hello World !!");

        assert_eq!(
            inner_sink.after_snapshots()[0].response_body.as_deref(),
            Some("Hello World !!")
        );
        // The outer filter sees an already captured response
        assert_eq!(outer_sink.after_snapshots()[0].response_code, 200);
        assert_eq!(outer_sink.after_snapshots()[0].response_body, None);
    }

    #[derive(Debug, PartialEq)]
    struct Downstream(&'static str);

    #[tokio::test]
    async fn test_inner_error_propagates_after_logging() {
        let sink = Arc::new(RecordingSink::new());
        let service = RequestLoggingLayer::new(payload_config(), sink.clone()).layer(
            tower::service_fn(|_: Request| async { Err::<Response, _>(Downstream("boom")) }),
        );

        let err = service
            .oneshot(Request::builder().uri("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, Downstream("boom"));

        let after = &sink.after_snapshots()[0];
        assert_eq!(after.response_code, 500);
        assert_eq!(after.response_body, None);
        assert_eq!(CorrelationContext::current(), None);
    }

    #[tokio::test]
    async fn test_panic_resumed_after_logging() {
        let sink = Arc::new(RecordingSink::new());
        let service = RequestLoggingLayer::new(payload_config(), sink.clone()).layer(
            tower::service_fn(|_: Request| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<Response, Infallible>(Response::new(Body::empty()))
            }),
        );

        let outcome = AssertUnwindSafe(
            service.oneshot(Request::builder().uri("/panic").body(Body::empty()).unwrap()),
        )
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(sink.after_snapshots()[0].response_code, 500);
        assert_eq!(CorrelationContext::current(), None);
    }

    #[derive(Clone)]
    struct PanicOnCall;

    impl Service<Request> for PanicOnCall {
        type Response = Response;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request) -> Self::Future {
            panic!("service failed before producing a future");
        }
    }

    #[tokio::test]
    async fn test_panic_in_call_still_logged_after() {
        let sink = Arc::new(RecordingSink::new());
        let service = RequestLoggingLayer::new(payload_config(), sink.clone()).layer(PanicOnCall);

        let outcome = AssertUnwindSafe(
            service.oneshot(Request::builder().uri("/panic").body(Body::empty()).unwrap()),
        )
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(sink.before_snapshots().len(), 1);
        let after = sink.after_snapshots();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].response_code, 500);
        assert_eq!(after[0].request.request_uri, "/panic");
    }

    async fn answer_later(
        State(executor): State<Arc<TaskExecutor>>,
        Extension(lifecycle): Extension<Arc<RequestLifecycle>>,
        body: String,
    ) -> Response {
        match lifecycle.start_async(&executor, move || format!("got {}", body)) {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => e.into_response(),
        }
    }

    #[tokio::test]
    async fn test_continuation_logs_body_read_by_original_dispatch() {
        let sink = Arc::new(RecordingSink::new());
        let executor = Arc::new(TaskExecutor::new(&ExecutorConfig::default()).unwrap());
        let app = Router::new()
            .route("/later", post(answer_later))
            .with_state(executor)
            .layer(AsyncResultLayer)
            .layer(RequestLoggingLayer::new(payload_config(), sink.clone()))
            .layer(AsyncDispatchLayer);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/later")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "got payload");

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert!(records[0].is_before());
        assert!(records[1].is_before());

        let after = &sink.after_snapshots()[0];
        assert_eq!(after.request.request_body.as_deref(), Some("payload"));
        assert_eq!(after.response_body.as_deref(), Some("got payload"));
        assert_eq!(after.response_code, 200);
    }

    #[tokio::test]
    async fn test_each_request_gets_new_request_id() {
        let sink = Arc::new(RecordingSink::new());
        let app = app(payload_config(), sink.clone());
        for _ in 0..2 {
            app.clone()
                .oneshot(Request::builder().uri("/greet").body(Body::empty()).unwrap())
                .await
                .unwrap();
        }

        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].request_id(), records[1].request_id());
        assert_ne!(records[1].request_id(), records[2].request_id());
    }
}
