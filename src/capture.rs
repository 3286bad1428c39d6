//! Body caching for logging.
//!
//! The request side tees data frames into a bounded buffer while they flow to
//! the handler, so the bytes the handler consumed can be logged afterwards.
//! The response side buffers the whole body produced by the handler and then
//! replays it to the client exactly once.

use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Frame, SizeHint};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tracing::{debug, error};

/// Error type for body capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Body stream error: {0}")]
    Stream(String),
}

/// Shared buffer holding the request bytes read so far.
///
/// Stored in the request extensions by [`RequestBodyCache::install`]; its
/// presence marks the request as already wrapped.
#[derive(Clone, Debug)]
pub struct RequestBodyCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    buf: Mutex<BytesMut>,
    limit: usize,
    charset: Option<String>,
}

impl RequestBodyCache {
    fn new(limit: usize, charset: Option<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                buf: Mutex::new(BytesMut::new()),
                limit,
                charset,
            }),
        }
    }

    /// Wrap the request body so that up to `limit` bytes are cached as the
    /// handler reads them.
    ///
    /// Returns `false` without touching the request when it is already
    /// wrapped.
    pub fn install(request: &mut Request<Body>, limit: usize) -> bool {
        if Self::from_request(request).is_some() {
            return false;
        }

        let cache = Self::new(limit, declared_charset(request.headers()));
        let body = mem::replace(request.body_mut(), Body::empty());
        *request.body_mut() = Body::new(CachingBody {
            inner: body,
            cache: cache.clone(),
        });
        request.extensions_mut().insert(cache);
        debug!(limit, "Request body cache installed");
        true
    }

    /// Cache attached to the request, if any
    pub fn from_request<B>(request: &Request<B>) -> Option<&RequestBodyCache> {
        request.extensions().get::<RequestBodyCache>()
    }

    /// Bytes captured so far
    pub fn content(&self) -> Bytes {
        self.inner.buf.lock().clone().freeze()
    }

    /// Character encoding declared by the request's content type
    pub fn charset(&self) -> Option<&str> {
        self.inner.charset.as_deref()
    }

    /// Maximum number of bytes retained
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    fn append(&self, data: &[u8]) {
        let mut buf = self.inner.buf.lock();
        let room = self.inner.limit.saturating_sub(buf.len());
        if room > 0 {
            buf.extend_from_slice(&data[..room.min(data.len())]);
        }
    }
}

pin_project! {
    /// Pass-through body that copies data frames into a [`RequestBodyCache`].
    pub struct CachingBody<B> {
        #[pin]
        inner: B,
        cache: RequestBodyCache,
    }
}

impl<B> hyper::body::Body for CachingBody<B>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.cache.append(data);
                }
            }
            Some(Err(e)) => error!(error = %e, "Stream error during request body capture"),
            None => {}
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Marks a response whose body has already been captured and replayed.
#[derive(Clone, Copy, Debug)]
pub struct CapturedMarker;

/// Response whose body has been fully buffered.
///
/// The real client only sees the body once [`copy_body_to_response`] has been
/// called; dropping a `CachedResponse` without it loses the body.
///
/// [`copy_body_to_response`]: CachedResponse::copy_body_to_response
#[derive(Debug)]
pub struct CachedResponse {
    parts: axum::http::response::Parts,
    content: Bytes,
}

impl CachedResponse {
    /// Drain the response body into memory
    pub async fn capture(response: Response) -> Result<Self, CaptureError> {
        let (parts, body) = response.into_parts();
        let content = body
            .collect()
            .await
            .map_err(|e| {
                error!(error = %e, "Stream error during response body capture");
                CaptureError::Stream(e.to_string())
            })?
            .to_bytes();

        Ok(Self { parts, content })
    }

    /// Whether the response already went through a capture
    pub fn is_captured(response: &Response) -> bool {
        response.extensions().get::<CapturedMarker>().is_some()
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Buffered body bytes
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Rebuild the real response carrying the complete buffered body
    pub fn copy_body_to_response(self) -> Response {
        let mut parts = self.parts;
        if !self.content.is_empty() {
            parts.headers.remove(TRANSFER_ENCODING);
            parts
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(self.content.len()));
        }
        parts.extensions.insert(CapturedMarker);
        Response::from_parts(parts, Body::from(self.content))
    }
}

/// Charset parameter of the `Content-Type` header, lowercased
pub fn declared_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn request_with_body(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .uri("/news")
            .header(CONTENT_TYPE, "text/plain; charset=ISO-8859-1")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_cache_tees_consumed_bytes() {
        let mut request = request_with_body("Hello, World!");
        assert!(RequestBodyCache::install(&mut request, 1024));

        let cache = RequestBodyCache::from_request(&request).unwrap().clone();
        assert!(cache.content().is_empty());

        let read = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(read, "Hello, World!");
        assert_eq!(cache.content(), "Hello, World!");
        assert_eq!(cache.charset(), Some("iso-8859-1"));
    }

    #[tokio::test]
    async fn test_request_cache_is_bounded_but_pass_through_is_not() {
        let mut request = request_with_body("x".repeat(100));
        RequestBodyCache::install(&mut request, 10);
        let cache = RequestBodyCache::from_request(&request).unwrap().clone();

        let read = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(read.len(), 100);
        assert_eq!(cache.content().len(), 10);
        assert_eq!(cache.limit(), 10);
    }

    #[tokio::test]
    async fn test_request_cache_install_is_idempotent() {
        let mut request = request_with_body("once");
        assert!(RequestBodyCache::install(&mut request, 1024));
        assert!(!RequestBodyCache::install(&mut request, 1024));

        let cache = RequestBodyCache::from_request(&request).unwrap().clone();
        let read = request.into_body().collect().await.unwrap().to_bytes();

        // A second tee would have doubled the cached bytes
        assert_eq!(read, "once");
        assert_eq!(cache.content(), "once");
    }

    #[tokio::test]
    async fn test_request_cache_captures_streamed_chunks() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("chunk1")),
            Ok(Bytes::from("chunk2")),
        ]);
        let mut request = request_with_body(Body::from_stream(chunks));
        RequestBodyCache::install(&mut request, 1024);
        let cache = RequestBodyCache::from_request(&request).unwrap().clone();

        request.into_body().collect().await.unwrap();
        assert_eq!(cache.content(), "chunk1chunk2");
    }

    #[tokio::test]
    async fn test_response_capture_replays_full_body_once() {
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .body(Body::from("Hello World !!"))
            .unwrap();
        assert!(!CachedResponse::is_captured(&response));

        let cached = CachedResponse::capture(response).await.unwrap();
        assert_eq!(cached.status(), StatusCode::CREATED);
        assert_eq!(cached.content(), "Hello World !!");

        let replayed = cached.copy_body_to_response();
        assert!(CachedResponse::is_captured(&replayed));
        assert_eq!(replayed.headers()[CONTENT_LENGTH], "14");

        let body = replayed.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "Hello World !!");
    }

    #[tokio::test]
    async fn test_response_capture_empty_body() {
        let response = Response::new(Body::empty());
        let cached = CachedResponse::capture(response).await.unwrap();

        assert!(cached.content().is_empty());
        let replayed = cached.copy_body_to_response();
        assert!(replayed.headers().get(CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_response_capture_stream_error() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("partial")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let response = Response::new(Body::from_stream(chunks));

        let err = CachedResponse::capture(response).await.unwrap_err();
        assert!(matches!(err, CaptureError::Stream(_)));
    }

    #[test]
    fn test_declared_charset() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_charset(&headers), None);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(declared_charset(&headers), None);

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; Charset=\"UTF-8\""),
        );
        assert_eq!(declared_charset(&headers), Some("utf-8".to_string()));
    }
}
