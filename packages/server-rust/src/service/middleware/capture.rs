//! Request/response body capture and request logging.
//!
//! With body logging enabled, the request body is buffered (up to
//! `max_request_body`), logged in redacted and truncated form, then handed
//! downstream as a fresh body holding the same bytes. The response body is
//! wrapped in [`CaptureBody`], which forwards every frame untouched while
//! mirroring data into a size-capped [`CapturedBody`]. The completion line
//! (method, route, status, duration, sizes) is emitted once, when the
//! response body finishes or is dropped, so it reflects what was actually
//! streamed to the client.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use gatehouse_core::CapturedBody;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, info};

use super::{request_context, route_of, ResponseFuture};
use crate::service::config::CaptureConfig;
use crate::service::error::CaptureError;

// ---------------------------------------------------------------------------
// CaptureLayer
// ---------------------------------------------------------------------------

/// Tower layer logging every request and, optionally, its redacted bodies.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    config: Arc<CaptureConfig>,
}

impl CaptureLayer {
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CaptureService<S> {
    inner: S,
    config: Arc<CaptureConfig>,
}

impl<S> Service<Request> for CaptureService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The readied service handles this request; the clone waits for the next.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let start = Instant::now();
            let ctx = request_context(&req);
            let method = req.method().clone();
            let route = route_of(&req);

            let (req, request_size) = if config.log_bodies {
                match buffer_request(req, &config).await {
                    Ok((req, size)) => (req, Some(size)),
                    Err(err) => {
                        debug!(
                            correlation_id = ctx.correlation_id(),
                            error = %err,
                            "request body rejected before logging"
                        );
                        return Ok(err.into_response());
                    }
                }
            } else {
                let size = req.body().size_hint().exact();
                (req, size)
            };

            let response = inner.call(req).await?;

            let log = ResponseLog {
                correlation_id: ctx.correlation_id().to_owned(),
                method,
                route,
                status: response.status(),
                start,
                request_size,
                body: CapturedBody::new(if config.log_bodies { config.capture_limit } else { 0 }),
                config,
            };
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, Body::new(CaptureBody::new(body, log))))
        })
    }
}

/// Buffers the request body, logs its redacted rendering, and rebuilds the
/// request around the same bytes.
async fn buffer_request(req: Request, config: &CaptureConfig) -> Result<(Request, u64), CaptureError> {
    let (parts, body) = req.into_parts();
    let bytes = Limited::new(body, config.max_request_body)
        .collect()
        .await
        .map_err(|err| {
            if err.is::<LengthLimitError>() {
                CaptureError::BodyTooLarge {
                    limit: config.max_request_body,
                }
            } else {
                CaptureError::BodyRead(err)
            }
        })?
        .to_bytes();

    let ctx = parts
        .extensions
        .get::<gatehouse_core::RequestContext>()
        .cloned()
        .unwrap_or_default();
    debug!(
        correlation_id = ctx.correlation_id(),
        method = %parts.method,
        path = parts.uri.path(),
        request_size = bytes.len(),
        request_body = %config.redaction.render(&bytes, config.capture_limit),
        "request body"
    );

    let size = bytes.len() as u64;
    Ok((Request::from_parts(parts, Body::from(bytes)), size))
}

// ---------------------------------------------------------------------------
// Response side
// ---------------------------------------------------------------------------

/// Everything needed to emit the completion line once the body is done.
struct ResponseLog {
    correlation_id: String,
    method: Method,
    route: String,
    status: StatusCode,
    start: Instant,
    request_size: Option<u64>,
    body: CapturedBody,
    config: Arc<CaptureConfig>,
}

impl ResponseLog {
    fn emit(self) {
        let elapsed = self.start.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let response_size = self.body.total_len();

        metrics::counter!(
            "http_requests_total",
            "method" => self.method.to_string(),
            "status" => self.status.as_u16().to_string(),
        )
        .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        if self.config.log_bodies {
            info!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                route = %self.route,
                status = self.status.as_u16(),
                duration_ms,
                request_size = self.request_size,
                response_size,
                response_body = %self.body.render(&self.config.redaction),
                "request completed"
            );
        } else {
            info!(
                correlation_id = %self.correlation_id,
                method = %self.method,
                route = %self.route,
                status = self.status.as_u16(),
                duration_ms,
                request_size = self.request_size,
                response_size,
                "request completed"
            );
        }
    }
}

/// Response body that mirrors data frames into a capture buffer while
/// forwarding them unchanged.
pub struct CaptureBody {
    inner: Body,
    log: Option<ResponseLog>,
}

impl CaptureBody {
    fn new(inner: Body, log: ResponseLog) -> Self {
        Self {
            inner,
            log: Some(log),
        }
    }

    fn finish(&mut self) {
        if let Some(log) = self.log.take() {
            log.emit();
        }
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(log)) = (frame.data_ref(), this.log.as_mut()) {
                    log.body.push(data);
                }
            }
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(_))) | Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use axum::routing::{get, post};
    use axum::Router;
    use gatehouse_core::redaction::{REDACTION_MARKER, TRUNCATION_SUFFIX, WITHHELD_MARKER};
    use tower::ServiceExt;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(buffer.clone())
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (buffer, guard)
    }

    fn logging_bodies() -> CaptureConfig {
        CaptureConfig {
            log_bodies: true,
            ..CaptureConfig::default()
        }
    }

    fn app(config: CaptureConfig) -> Router {
        Router::new()
            .route("/echo", post(|body: Bytes| async move { body }))
            .route("/large", get(|| async { "z".repeat(5000) }))
            .route(
                "/large-json",
                get(|| async { format!(r#"{{"token":"tok-3141","rows":"{}"}}"#, "r".repeat(4000)) }),
            )
            .layer(CaptureLayer::new(config))
    }

    async fn send(app: Router, req: Request) -> (StatusCode, Bytes) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    fn post_echo(body: impl Into<Body>) -> Request {
        Request::builder()
            .method("POST")
            .uri("/echo")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn sensitive_fields_are_redacted_in_logs() {
        let (logs, _guard) = capture_logs();
        let payload = r#"{"username":"u","password":"p"}"#;

        let (status, echoed) = send(app(logging_bodies()), post_echo(payload)).await;
        assert_eq!(status, StatusCode::OK);
        // Downstream read the full, original body.
        assert_eq!(echoed, payload.as_bytes());

        let output = logs.contents();
        assert!(output.contains(REDACTION_MARKER), "{output}");
        assert!(output.contains(r#"\"username\":\"u\""#) || output.contains(r#""username":"u""#), "{output}");
        assert!(!output.contains(r#""password":"p""#), "{output}");
        assert!(!output.contains(r#"\"password\":\"p\""#), "{output}");
    }

    #[tokio::test]
    async fn non_json_body_is_truncated() {
        let (logs, _guard) = capture_logs();
        let payload = "x".repeat(3000);

        let (_, echoed) = send(app(logging_bodies()), post_echo(payload.clone())).await;
        assert_eq!(echoed.len(), 3000);

        let output = logs.contents();
        assert!(output.contains(TRUNCATION_SUFFIX), "{output}");
        assert!(!output.contains(&payload));
    }

    #[tokio::test]
    async fn response_bytes_are_unchanged_by_capture() {
        let (logs, _guard) = capture_logs();
        let request = Request::builder().uri("/large").body(Body::empty()).unwrap();

        let (status, bytes) = send(app(logging_bodies()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, "z".repeat(5000).as_bytes());

        let output = logs.contents();
        assert!(output.contains("request completed"));
        assert!(output.contains("response_size=5000"), "{output}");
        assert!(output.contains("status=200"), "{output}");
    }

    #[tokio::test]
    async fn truncated_json_response_never_logs_sensitive_values() {
        let (logs, _guard) = capture_logs();
        let request = Request::builder().uri("/large-json").body(Body::empty()).unwrap();

        let (status, bytes) = send(app(logging_bodies()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(std::str::from_utf8(&bytes).unwrap().contains("tok-3141"));

        let output = logs.contents();
        assert!(output.contains(WITHHELD_MARKER), "{output}");
        assert!(!output.contains("tok-3141"), "{output}");
    }

    #[tokio::test]
    async fn completion_is_logged_once_without_bodies() {
        let (logs, _guard) = capture_logs();
        let (_, _) = send(app(CaptureConfig::default()), post_echo("hello")).await;

        let output = logs.contents();
        assert_eq!(output.matches("request completed").count(), 1, "{output}");
        assert!(!output.contains("request body"));
        assert!(!output.contains("response_body"));
    }

    #[tokio::test]
    async fn oversized_request_body_is_rejected() {
        let config = CaptureConfig {
            max_request_body: 16,
            ..logging_bodies()
        };
        let (status, _) = send(app(config), post_echo("y".repeat(64))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn dropped_response_body_still_logs() {
        let (logs, _guard) = capture_logs();
        let request = Request::builder().uri("/large").body(Body::empty()).unwrap();
        let response = app(CaptureConfig::default()).oneshot(request).await.unwrap();
        drop(response);

        assert_eq!(logs.contents().matches("request completed").count(), 1);
    }
}
