//! Request correlation ID middleware.
//!
//! Built on `tower-http`'s request-id layers: `SetRequestId` keeps a usable
//! inbound `X-Request-ID` or generates a UUID v4, and `PropagateRequestId`
//! copies it onto the response. Inbound identifiers that are blank, not
//! visible ASCII, or longer than [`MAX_INBOUND_ID_LEN`] are stripped first so
//! a fresh one is generated instead. The identifier is bound into the
//! [`RequestContext`](gatehouse_core::RequestContext) and published to the
//! [`CorrelationSlot`] seeded by the outer panic guard, so even a response
//! synthesized after a catastrophic failure further down carries it.

use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use tower::{Layer, Service, ServiceBuilder};
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestId, PropagateRequestIdLayer, RequestId, SetRequestId,
    SetRequestIdLayer,
};

use super::{request_context, ResponseFuture};

/// The header carrying the correlation identifier.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Inbound identifiers longer than this are replaced with a generated one.
pub const MAX_INBOUND_ID_LEN: usize = 200;

/// Write-once cell through which the correlation ID reaches layers that run
/// outside this one.
#[derive(Debug, Clone, Default)]
pub struct CorrelationSlot(Arc<OnceLock<HeaderValue>>);

impl CorrelationSlot {
    /// Publishes the identifier; later publications are ignored.
    pub fn publish(&self, value: HeaderValue) {
        let _ = self.0.set(value);
    }

    #[must_use]
    pub fn get(&self) -> Option<&HeaderValue> {
        self.0.get()
    }
}

/// Returns the inbound identifier if present, visible ASCII, non-blank, and
/// within the length cap.
fn inbound_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.trim().is_empty() && id.len() <= MAX_INBOUND_ID_LEN)
}

// ---------------------------------------------------------------------------
// CorrelationLayer
// ---------------------------------------------------------------------------

type RequestIdStack<S> = SetRequestId<PropagateRequestId<BindCorrelation<S>>, MakeRequestUuid>;

/// Tower layer binding a correlation ID to every request and response.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationLayer;

impl CorrelationLayer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let inner = ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(X_REQUEST_ID.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID.clone()))
            .service(BindCorrelation { inner });
        CorrelationService { inner }
    }
}

// ---------------------------------------------------------------------------
// CorrelationService
// ---------------------------------------------------------------------------

/// Strips unusable inbound identifiers, then runs the request-id stack.
#[derive(Clone)]
pub struct CorrelationService<S> {
    inner: RequestIdStack<S>,
}

impl<S> std::fmt::Debug for CorrelationService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationService").finish_non_exhaustive()
    }
}

impl<S> Service<Request> for CorrelationService<S>
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
        if inbound_id(req.headers()).is_none() {
            req.headers_mut().remove(&X_REQUEST_ID);
        }
        Box::pin(self.inner.call(req))
    }
}

/// Binds the identifier chosen by `SetRequestId` into the request context.
#[derive(Debug, Clone)]
pub struct BindCorrelation<S> {
    inner: S,
}

impl<S> Service<Request> for BindCorrelation<S>
where
    S: Service<Request, Response = Response, Error = Infallible>,
{
    type Response = Response;
    type Error = Infallible;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let header = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.header_value().clone());

        if let Some(value) = header {
            if let Some(slot) = req.extensions().get::<CorrelationSlot>() {
                slot.publish(value.clone());
            }
            if let Ok(id) = value.to_str() {
                let ctx = request_context(&req).with_correlation_id(id);
                req.extensions_mut().insert(ctx);
            }
        }

        self.inner.call(req)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
