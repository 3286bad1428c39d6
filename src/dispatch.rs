//! Suspend-and-resume request dispatch.
//!
//! A handler may hand the production of its response to the task executor
//! through [`RequestLifecycle::start_async`]. The request is then suspended:
//! the response returned by the original dispatch is discarded, and once the
//! job completes the request is dispatched a second time, as an async
//! continuation carrying the same lifecycle and extensions, through the same
//! middleware stack.
//!
//! Two layers drive this:
//!
//! - [`AsyncDispatchLayer`], outermost, creates the lifecycle, waits for a
//!   suspended request's result and re-dispatches the continuation.
//! - [`AsyncResultLayer`], innermost, answers a continuation with the job's
//!   result instead of routing it to the handler again.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::Extensions;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::error::{ReqlogError, Result};
use crate::executor::TaskExecutor;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Where a request stands in its dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// First pass through the middleware stack
    OriginalDispatch,
    /// Handler handed its work to the executor; response not yet final
    AsyncStarted,
    /// Second pass, after the async work completed
    AsyncContinuation,
    /// Final response produced
    Complete,
}

/// Per-request dispatch state shared by every pass of the same request.
///
/// Stored in the request extensions as `Arc<RequestLifecycle>`.
#[derive(Debug, Default)]
pub struct RequestLifecycle {
    continuation: AtomicBool,
    suspended: AtomicBool,
    pending: Mutex<Option<oneshot::Receiver<Response>>>,
    result: Mutex<Option<Response>>,
    attributes: Mutex<Extensions>,
}

impl RequestLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lifecycle attached to the request, if any
    pub fn from_request<B>(request: &axum::http::Request<B>) -> Option<Arc<Self>> {
        request.extensions().get::<Arc<RequestLifecycle>>().cloned()
    }

    /// Whether this pass is the re-entry after async completion
    pub fn is_async_continuation(&self) -> bool {
        self.continuation.load(Ordering::SeqCst)
    }

    /// Whether the handler suspended the request into async processing
    pub fn is_async_started(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Store a value that every later pass of this request will see in its
    /// extensions
    pub fn set_attribute<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.attributes.lock().insert(value);
    }

    pub fn state(&self) -> DispatchState {
        if self.is_async_started() {
            DispatchState::AsyncStarted
        } else if self.is_async_continuation() {
            DispatchState::AsyncContinuation
        } else {
            DispatchState::OriginalDispatch
        }
    }

    /// Suspend the request and produce its response on the executor.
    ///
    /// Only allowed once per request, during the original dispatch.
    pub fn start_async<F, R>(&self, executor: &TaskExecutor, job: F) -> Result<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoResponse,
    {
        if self.is_async_continuation() || self.suspended.swap(true, Ordering::SeqCst) {
            return Err(ReqlogError::InvalidRequest(
                "async processing already started for this request".into(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(rx);

        let submitted = executor.submit(move || {
            if tx.send(job().into_response()).is_err() {
                warn!("Async result produced after the request was abandoned");
            }
        });

        if let Err(e) = submitted {
            self.pending.lock().take();
            self.suspended.store(false, Ordering::SeqCst);
            return Err(e);
        }

        debug!("Request suspended into async processing");
        Ok(())
    }

    /// Wait for the async job to deliver its response
    async fn await_result(&self) -> Result<Response> {
        let pending = self.pending.lock().take();
        match pending {
            Some(rx) => rx.await.map_err(|_| ReqlogError::AsyncTaskDropped),
            None => Err(ReqlogError::AsyncTaskDropped),
        }
    }

    /// Switch to the continuation pass with the final response ready
    fn resume(&self, result: Response) {
        *self.result.lock() = Some(result);
        self.continuation.store(true, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
    }

    fn attributes(&self) -> Extensions {
        self.attributes.lock().clone()
    }

    fn take_result(&self) -> Option<Response> {
        self.result.lock().take()
    }
}

/// Outermost layer emulating the host's async dispatch
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncDispatchLayer;

impl<S> Layer<S> for AsyncDispatchLayer {
    type Service = AsyncDispatchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AsyncDispatchService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncDispatchService<S> {
    inner: S,
}

impl<S> Service<Request> for AsyncDispatchService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let lifecycle = match RequestLifecycle::from_request(&request) {
            Some(lifecycle) => lifecycle,
            None => {
                let lifecycle = RequestLifecycle::new();
                request.extensions_mut().insert(lifecycle.clone());
                lifecycle
            }
        };

        // Everything but the body is replayed on the continuation
        let mut continuation = Request::new(Body::empty());
        *continuation.method_mut() = request.method().clone();
        *continuation.uri_mut() = request.uri().clone();
        *continuation.version_mut() = request.version();
        *continuation.headers_mut() = request.headers().clone();
        let mut extensions = request.extensions().clone();

        Box::pin(async move {
            let response = inner.call(request).await?;
            if !lifecycle.is_async_started() {
                return Ok(response);
            }

            let result = match lifecycle.await_result().await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Async processing failed");
                    e.into_response()
                }
            };

            lifecycle.resume(result);
            extensions.extend(lifecycle.attributes());
            *continuation.extensions_mut() = extensions;
            debug!("Dispatching async continuation");

            inner.ready().await?.call(continuation).await
        })
    }
}

/// Innermost layer answering a continuation with the async result
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncResultLayer;

impl<S> Layer<S> for AsyncResultLayer {
    type Service = AsyncResultService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AsyncResultService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncResultService<S> {
    inner: S,
}

impl<S> Service<Request> for AsyncResultService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let result = RequestLifecycle::from_request(&request)
            .filter(|lifecycle| lifecycle.is_async_continuation())
            .and_then(|lifecycle| lifecycle.take_result());

        match result {
            Some(response) => Box::pin(async move { Ok(response) }),
            None => Box::pin(self.inner.call(request)),
        }
    }
}
