//! Per-request correlation context
//!
//! A [`CorrelationContext`] is established when a request enters the logging
//! filter and is visible to everything running inside its scope: the request's
//! own tokio task through a task-local, and executor worker threads through a
//! thread-local installed by the task decorator. Every `tracing` event emitted
//! inside a scope carries the `request_id` field of the enclosing `request`
//! span.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

/// Key under which the correlation identifier is stored
pub const REQUEST_ID_KEY: &str = "request_id";

tokio::task_local! {
    static TASK_CONTEXT: CorrelationContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<CorrelationContext>> = const { RefCell::new(None) };
}

/// Key/value context attached to one logical unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    entries: BTreeMap<String, String>,
}

impl CorrelationContext {
    /// Start a new context with a freshly generated request id
    pub fn begin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(REQUEST_ID_KEY.to_string(), Uuid::new_v4().to_string());
        Self { entries }
    }

    /// Context active for the current task or worker thread, if any
    pub fn current() -> Option<Self> {
        TASK_CONTEXT
            .try_with(Clone::clone)
            .ok()
            .or_else(|| THREAD_CONTEXT.with(|c| c.borrow().clone()))
            .filter(CorrelationContext::is_active)
    }

    /// Correlation identifier of this context
    pub fn request_id(&self) -> Option<&str> {
        self.get(REQUEST_ID_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the context still holds any keys
    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Clear every key of this value.
    ///
    /// The context installed for a task or thread is not reached through
    /// here: it ends when its [`scope`] or [`scope_sync`] returns, which is
    /// also where the logging filter tears it down.
    pub fn end(&mut self) {
        self.entries.clear();
    }

    /// Span whose fields are attached to every event recorded inside it
    pub fn span(&self) -> Span {
        info_span!("request", request_id = %self.request_id().unwrap_or_default())
    }
}

/// Run a future with `ctx` as the current context of its task.
pub async fn scope<F: Future>(ctx: CorrelationContext, fut: F) -> F::Output {
    let span = ctx.span();
    TASK_CONTEXT.scope(ctx, fut.instrument(span)).await
}

/// Run a closure with `ctx` installed on the current thread.
///
/// The thread's previous context is restored afterwards, also when `f`
/// panics.
pub fn scope_sync<R>(ctx: CorrelationContext, f: impl FnOnce() -> R) -> R {
    let span = ctx.span();
    let _restore = ThreadContextGuard::install(ctx);
    span.in_scope(f)
}

/// Capture the current context now and re-establish it around `fut`.
///
/// Used for futures handed to `tokio::spawn`, which do not inherit the
/// spawning task's locals.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let captured = CorrelationContext::current();
    async move {
        match captured {
            Some(ctx) => scope(ctx, fut).await,
            None => fut.await,
        }
    }
}

struct ThreadContextGuard {
    previous: Option<CorrelationContext>,
}

impl ThreadContextGuard {
    fn install(ctx: CorrelationContext) -> Self {
        let previous = THREAD_CONTEXT.with(|c| c.replace(Some(ctx)));
        Self { previous }
    }
}

impl Drop for ThreadContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|c| *c.borrow_mut() = previous);
    }
}
