//! Outermost panic barrier.
//!
//! Covers the middleware that runs on the request-serving task itself, both
//! while it builds its response future (`call`) and while that future is
//! polled. A recovered panic is logged and answered with the same sanitized
//! 500 the supervisor produces. The guard seeds a [`CorrelationSlot`] before
//! delegating so the synthesized response still carries `X-Request-ID`.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::Method;
use axum::response::Response;
use gatehouse_core::{catch_sync, CatchUnwindExt, PanicReport};
use tower::{Layer, Service};
use tracing::error;

use super::correlation::{CorrelationSlot, X_REQUEST_ID};
use super::{route_of, ResponseFuture};
use crate::service::error::panic_response;

/// Tower layer converting any panic below it into a 500 response.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicGuardLayer {
    expose_details: bool,
}

impl PanicGuardLayer {
    #[must_use]
    pub fn new(expose_details: bool) -> Self {
        Self { expose_details }
    }
}

impl<S> Layer<S> for PanicGuardLayer {
    type Service = PanicGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicGuardService {
            inner,
            expose_details: self.expose_details,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PanicGuardService<S> {
    inner: S,
    expose_details: bool,
}

impl<S> Service<Request> for PanicGuardService<S>
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
        let slot = CorrelationSlot::default();
        req.extensions_mut().insert(slot.clone());
        let recovery = Recovery {
            slot,
            method: req.method().clone(),
            route: route_of(&req),
            expose_details: self.expose_details,
        };

        match catch_sync(|| self.inner.call(req)) {
            Ok(fut) => Box::pin(async move {
                match fut.catch_unwind().await {
                    Ok(result) => result,
                    Err(report) => Ok(recovery.respond(&report)),
                }
            }),
            Err(report) => Box::pin(std::future::ready(Ok(recovery.respond(&report)))),
        }
    }
}

struct Recovery {
    slot: CorrelationSlot,
    method: Method,
    route: String,
    expose_details: bool,
}

impl Recovery {
    fn respond(&self, report: &PanicReport) -> Response {
        let correlation_id = self
            .slot
            .get()
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        error!(
            correlation_id,
            method = %self.method,
            route = %self.route,
            panic.message = %report.message,
            "panic.type" = report.type_name,
            panic.location = report.location.as_deref().unwrap_or("unknown"),
            panic.backtrace = %report.backtrace,
            "recovered panic in request pipeline"
        );
        metrics::counter!("http_request_panics_total", "layer" => "panic_guard").increment(1);

        let mut response = panic_response(report, self.expose_details);
        if let Some(id) = self.slot.get() {
            response.headers_mut().insert(X_REQUEST_ID.clone(), id.clone());
        }
        response
    }
}
