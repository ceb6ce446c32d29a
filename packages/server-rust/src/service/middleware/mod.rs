//! Tower middleware layers of the request pipeline.
//!
//! - [`panic_guard`]: Outermost panic barrier for the request-serving unit
//! - [`correlation`]: `X-Request-ID` extraction/generation and context binding
//! - [`tracing`]: Optional per-request span with trace/span identifiers
//! - [`identity`]: Bearer credential validation and subject binding
//! - [`capture`]: Body redaction/capture and request logging
//! - [`supervisor`]: Deadline-bounded, panic-isolated handler execution
//! - [`pipeline`]: Composes all layers into a single stack
//!
//! Every layer speaks `axum::extract::Request` / `axum::response::Response`
//! with `Infallible` errors: failures become responses, never errors.

pub mod capture;
pub mod correlation;
pub mod identity;
pub mod panic_guard;
pub mod pipeline;
pub mod supervisor;
pub mod tracing;

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use axum::extract::{MatchedPath, Request};
use axum::response::Response;
use gatehouse_core::RequestContext;

pub use capture::CaptureLayer;
pub use correlation::{CorrelationLayer, CorrelationSlot, X_REQUEST_ID};
pub use identity::{CredentialVerifier, IdentityLayer};
pub use panic_guard::PanicGuardLayer;
pub use pipeline::build_pipeline_layers;
pub use supervisor::{ResponseCommit, SupervisorLayer};
pub use self::tracing::{request_span_layer, RequestSpanLayer};

/// Boxed response future shared by every pipeline service.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

/// The request's current context, or an empty one if no layer bound it yet.
pub(crate) fn request_context(req: &Request) -> RequestContext {
    req.extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default()
}

/// Route label for logs: the matched route template when routing already
/// happened, the raw path otherwise.
pub(crate) fn route_of(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |p| p.as_str().to_owned())
}
