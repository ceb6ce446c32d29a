//! Process-wide logging and metrics setup for the server binary.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::service::PRODUCTION_ENV;

/// Filter used when `RUST_LOG` is unset.
#[must_use]
pub fn default_filter(environment: &str) -> &'static str {
    if environment == PRODUCTION_ENV {
        "warn,gatehouse_server=info,gatehouse_core=info"
    } else {
        "info,gatehouse_server=debug,gatehouse_core=debug"
    }
}

/// Installs the global tracing subscriber.
///
/// Production emits one JSON object per event; every other environment gets
/// pretty, human-oriented output. `RUST_LOG` overrides the level filter.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(environment: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(environment)));
    let registry = tracing_subscriber::registry().with(filter);

    if environment == PRODUCTION_ENV {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .try_init()?;
    }
    Ok(())
}

/// Installs the global Prometheus recorder and returns its render handle.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}
