//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation lets the binary install collaborators
//! (catalog repository, metrics handle) between construction and serving.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    create_item, delete_item, get_item, health_handler, list_items, liveness_handler,
    metrics_handler, readiness_handler, AppState,
};
use super::lifecycle::Lifecycle;
use super::middleware::build_cors_layer;
use crate::service::config::PipelineConfig;
use crate::service::middleware::build_pipeline_layers;
use crate::service::{CatalogRepository, InMemoryCatalog};

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` -- allocates shared state (lifecycle, default catalog)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown, then drains
pub struct NetworkModule {
    config: NetworkConfig,
    pipeline: PipelineConfig,
    listener: Option<TcpListener>,
    lifecycle: Arc<Lifecycle>,
    catalog: Arc<dyn CatalogRepository>,
    metrics: Option<PrometheusHandle>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, pipeline: PipelineConfig) -> Self {
        Self {
            config,
            pipeline,
            listener: None,
            lifecycle: Arc::new(Lifecycle::new()),
            catalog: Arc::new(InMemoryCatalog::new()),
            metrics: None,
        }
    }

    /// Replaces the in-memory catalog with another repository.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogRepository>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Exposes the given recorder on `GET /metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Returns a shared reference to the lifecycle controller.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- Kubernetes liveness probe
    /// - `GET /health/ready` -- Kubernetes readiness probe
    /// - `GET /metrics` -- Prometheus exposition
    /// - `GET|POST /items`, `GET|DELETE /items/{id}` -- catalog
    ///
    /// Every route runs behind the full request pipeline; CORS sits outside it.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            lifecycle: Arc::clone(&self.lifecycle),
            catalog: Arc::clone(&self.catalog),
            metrics: self.metrics.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route("/items", get(list_items).post(create_item))
            .route("/items/{id}", get(get_item).delete(delete_item))
            .layer(build_pipeline_layers(&self.pipeline, self.lifecycle.stats()))
            .layer(build_cors_layer(&self.config.cors_origins))
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves, then drains.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. axum stops accepting and finishes open connections
    /// 3. Waits up to `drain_timeout` for supervised units (orphans
    ///    included) to finish
    /// 4. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// encounters a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };

        let router = self.build_router();
        let lifecycle = Arc::clone(&self.lifecycle);
        let signal_lifecycle = Arc::clone(&lifecycle);
        let signal = async move {
            shutdown.await;
            signal_lifecycle.trigger_shutdown();
        };

        // Transition to Ready so readiness probes pass.
        lifecycle.set_ready();
        info!("Serving HTTP connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        let stats = lifecycle.stats();
        if lifecycle.wait_for_drain(self.config.drain_timeout).await {
            info!("All supervised units drained");
        } else {
            warn!(
                in_flight = stats.in_flight(),
                orphaned = stats.orphaned(),
                "Drain timeout expired with supervised units still running"
            );
        }
        Ok(())
    }
}
