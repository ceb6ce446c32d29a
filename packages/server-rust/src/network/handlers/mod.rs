//! HTTP handler definitions for the Gatehouse server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod catalog;
pub mod health;

pub use catalog::{create_item, delete_item, get_item, list_items};
pub use health::{health_handler, liveness_handler, metrics_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::lifecycle::Lifecycle;
use crate::service::CatalogRepository;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Health state and supervised-unit accounting.
    pub lifecycle: Arc<Lifecycle>,
    /// Repository behind the item routes.
    pub catalog: Arc<dyn CatalogRepository>,
    /// Prometheus handle, present when the binary installed the recorder.
    pub metrics: Option<PrometheusHandle>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
