//! Optional per-request tracing span.
//!
//! When enabled, each request runs under `tower-http`'s [`TraceLayer`] with
//! one `http_request` span covering the rest of the pipeline. Trace and span
//! identifiers continue an inbound W3C `traceparent` header when one is
//! present and well-formed; otherwise they are freshly generated. Both are
//! bound into the [`RequestContext`](gatehouse_core::RequestContext) so
//! downstream log lines can be joined to the span. The span is dropped with
//! the response future or the response body, so timeouts and panics further
//! down never leak it. When disabled the layer is a pass-through.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::response::Response;
use tower::layer::util::Identity;
use tower::util::{option_layer, Either};
use tower::{Layer, Service};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{MakeSpan, OnResponse, Trace, TraceLayer};
use tracing::field::Empty;
use tracing::{info_span, Span};

use super::{request_context, route_of, ResponseFuture};
use crate::service::config::TracingConfig;

const TRACEPARENT: &str = "traceparent";

/// Trace identifiers of a request span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIds {
    /// 32 lowercase hex digits.
    pub trace_id: String,
    /// 16 lowercase hex digits.
    pub span_id: String,
}

impl TraceIds {
    /// Continues the trace of a valid inbound `traceparent`, otherwise starts
    /// a new trace. The span id is always fresh.
    #[must_use]
    pub fn for_request(headers: &HeaderMap) -> Self {
        let trace_id = headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_traceparent)
            .map_or_else(new_trace_id, str::to_owned);

        Self {
            trace_id,
            span_id: new_span_id(),
        }
    }
}

/// Extracts the trace id from `version-traceid-parentid-flags`.
fn parse_traceparent(value: &str) -> Option<&str> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;

    let hex = |s: &str, len: usize| {
        s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    };
    let valid = hex(version, 2)
        && version != "ff"
        && hex(trace_id, 32)
        && hex(parent_id, 16)
        && hex(flags, 2)
        && trace_id.bytes().any(|b| b != b'0')
        && parent_id.bytes().any(|b| b != b'0');

    valid.then_some(trace_id)
}

fn new_trace_id() -> String {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return format!("{id:032x}");
        }
    }
}

fn new_span_id() -> String {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return format!("{id:016x}");
        }
    }
}

// ---------------------------------------------------------------------------
// Span callbacks
// ---------------------------------------------------------------------------

/// Opens the `http_request` span from the context bound by
/// [`RequestSpanService`].
#[derive(Debug, Clone)]
pub struct RequestSpan {
    service_name: Arc<str>,
}

impl MakeSpan<Body> for RequestSpan {
    fn make_span(&mut self, req: &Request) -> Span {
        let ctx = request_context(req);
        info_span!(
            "http_request",
            service = %self.service_name,
            method = %req.method(),
            route = %route_of(req),
            correlation_id = ctx.correlation_id(),
            trace_id = ctx.trace_id(),
            span_id = ctx.span_id(),
            status = Empty,
            duration_ms = Empty,
        )
    }
}

/// Records the final status and latency on the request span.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordResponse;

impl<B> OnResponse<B> for RecordResponse {
    fn on_response(self, response: &axum::http::Response<B>, latency: Duration, span: &Span) {
        span.record("status", response.status().as_u16());
        span.record(
            "duration_ms",
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        );
    }
}

type RequestTrace<S> = Trace<
    S,
    SharedClassifier<ServerErrorsAsFailures>,
    RequestSpan,
    (),
    RecordResponse,
    (),
    (),
    (),
>;

// ---------------------------------------------------------------------------
// RequestSpanLayer
// ---------------------------------------------------------------------------

/// The span layer when tracing is enabled, a pass-through otherwise.
#[must_use]
pub fn request_span_layer(config: &TracingConfig) -> Either<RequestSpanLayer, Identity> {
    option_layer(config.enabled.then(|| RequestSpanLayer::new(config)))
}

/// Tower layer opening one span per request.
#[derive(Debug, Clone)]
pub struct RequestSpanLayer {
    service_name: Arc<str>,
}

impl RequestSpanLayer {
    #[must_use]
    pub fn new(config: &TracingConfig) -> Self {
        Self {
            service_name: Arc::from(config.service_name.as_str()),
        }
    }
}

impl<S> Layer<S> for RequestSpanLayer {
    type Service = RequestSpanService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let trace = TraceLayer::new_for_http()
            .make_span_with(RequestSpan {
                service_name: Arc::clone(&self.service_name),
            })
            .on_request(())
            .on_response(RecordResponse)
            .on_body_chunk(())
            .on_eos(())
            .on_failure(());
        RequestSpanService {
            inner: trace.layer(inner),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestSpanService
// ---------------------------------------------------------------------------

/// Binds fresh trace identifiers, then runs the traced inner service.
#[derive(Debug, Clone)]
pub struct RequestSpanService<S> {
    inner: RequestTrace<S>,
}

impl<S> Service<Request> for RequestSpanService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let ids = TraceIds::for_request(req.headers());
        let ctx = request_context(&req).with_trace(ids.trace_id, ids.span_id);
        req.extensions_mut().insert(ctx);

        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            Ok(response.map(Body::new))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
