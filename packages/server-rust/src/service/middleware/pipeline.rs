//! Pipeline composition: combines all middleware layers into a single stack.

use std::sync::Arc;

use tower::layer::util::{Identity, Stack};
use tower::util::Either;
use tower::ServiceBuilder;

use super::capture::CaptureLayer;
use super::correlation::CorrelationLayer;
use super::identity::IdentityLayer;
use super::panic_guard::PanicGuardLayer;
use super::supervisor::SupervisorLayer;
use super::tracing::{request_span_layer, RequestSpanLayer};
use crate::network::lifecycle::ExecutionStats;
use crate::service::config::PipelineConfig;

/// The composed layer stack returned by [`build_pipeline_layers`].
pub type PipelineLayers = ServiceBuilder<
    Stack<
        SupervisorLayer,
        Stack<
            CaptureLayer,
            Stack<
                IdentityLayer,
                Stack<
                    Either<RequestSpanLayer, Identity>,
                    Stack<CorrelationLayer, Stack<PanicGuardLayer, Identity>>,
                >,
            >,
        >,
    >,
>;

/// Builds the request pipeline applied to every route.
///
/// Layer order (outermost to innermost):
/// 1. `PanicGuardLayer` -- last-resort barrier for everything below
/// 2. `CorrelationLayer` -- bind `X-Request-ID` before anything logs
/// 3. `RequestSpanLayer` -- span covering the rest of the chain, if enabled
/// 4. `IdentityLayer` -- reject unauthenticated requests before any work
/// 5. `CaptureLayer` -- log request/response with redacted bodies
/// 6. `SupervisorLayer` -- run the handler under deadline and panic isolation
#[must_use]
pub fn build_pipeline_layers(config: &PipelineConfig, stats: Arc<ExecutionStats>) -> PipelineLayers {
    ServiceBuilder::new()
        .layer(PanicGuardLayer::new(config.supervisor.expose_panic_details))
        .layer(CorrelationLayer::new())
        .layer(request_span_layer(&config.tracing))
        .layer(IdentityLayer::new(&config.auth))
        .layer(CaptureLayer::new(config.capture.clone()))
        .layer(SupervisorLayer::new(config.supervisor.clone(), stats))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
