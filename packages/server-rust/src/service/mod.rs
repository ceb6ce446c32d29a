//! The request pipeline and the collaborators it fronts.
//!
//! 1. **Configuration** (`config`): per-stage settings, injected at construction
//! 2. **Middleware** (`middleware`): the Tower layers every request passes through
//! 3. **Deadline** (`deadline`): the cancellation context handed to handlers
//! 4. **Errors** (`error`): error taxonomy and JSON envelopes
//! 5. **Domain** (`domain`): the catalog repository behind the item routes

pub mod config;
pub mod deadline;
pub mod domain;
pub mod error;
pub mod middleware;

// Re-export key types for convenient access.
pub use config::{
    AuthConfig, CaptureConfig, PipelineConfig, SupervisorConfig, TracingConfig, PRODUCTION_ENV,
};
pub use deadline::Deadline;
pub use domain::{CatalogError, CatalogRepository, InMemoryCatalog, Item, NewItem};
pub use error::{AuthError, CaptureError, DeadlineExceeded};
pub use middleware::build_pipeline_layers;
