//! Gatehouse server binary.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use gatehouse_server::network::{NetworkConfig, NetworkModule};
use gatehouse_server::service::{
    AuthConfig, CaptureConfig, PipelineConfig, SupervisorConfig, TracingConfig,
};
use gatehouse_server::telemetry;

#[derive(Debug, Parser)]
#[command(name = "gatehouse-server", version, about = "Supervised axum request pipeline")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "GATEHOUSE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind; 0 picks an ephemeral port.
    #[arg(long, env = "GATEHOUSE_PORT", default_value_t = 8080)]
    port: u16,

    /// HMAC secret used to verify bearer credentials.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    #[arg(long, env = "TRACING_ENABLED", default_value_t = false)]
    tracing_enabled: bool,

    #[arg(long, env = "TRACING_SERVICE_NAME", default_value = "gatehouse")]
    tracing_service_name: String,

    /// Log redacted request and response bodies.
    #[arg(long, env = "LOG_BODIES", default_value_t = false)]
    log_bodies: bool,

    /// Deployment environment; `production` switches to JSON logs.
    #[arg(long, env = "APP_ENV", default_value = "development")]
    environment: String,

    /// Include panic values in 500 responses.
    #[arg(long, env = "EXPOSE_PANIC_DETAILS", default_value_t = false)]
    expose_panic_details: bool,

    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Paths served without credentials. Replaces the default health routes.
    #[arg(long, env = "AUTH_SKIP_PATHS", value_delimiter = ',')]
    auth_skip_paths: Vec<String>,

    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut auth = AuthConfig::with_secret(self.jwt_secret.clone());
        if !self.auth_skip_paths.is_empty() {
            auth.skip_paths = self
                .auth_skip_paths
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect::<HashSet<_>>();
        }

        PipelineConfig {
            environment: self.environment.clone(),
            auth,
            tracing: TracingConfig {
                enabled: self.tracing_enabled,
                service_name: self.tracing_service_name.clone(),
            },
            capture: CaptureConfig {
                log_bodies: self.log_bodies,
                ..CaptureConfig::default()
            },
            supervisor: SupervisorConfig {
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                expose_panic_details: self.expose_panic_details,
            },
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            ..NetworkConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(&args.environment)?;
    let metrics = telemetry::install_metrics_recorder()?;

    let pipeline = args.pipeline_config();
    if pipeline.supervisor.expose_panic_details && pipeline.is_production() {
        warn!("panic details are exposed in production responses");
    }
    info!(
        environment = %pipeline.environment,
        timeout_ms = args.request_timeout_ms,
        tracing = pipeline.tracing.enabled,
        log_bodies = pipeline.capture.log_bodies,
        "Starting gatehouse server"
    );

    let mut module = NetworkModule::new(args.network_config(), pipeline).with_metrics(metrics);
    let port = module.start().await?;
    info!(port, "Listening");

    if let Err(e) = module.serve(shutdown_signal()).await {
        error!(error = %e, "Server error occurred");
        return Err(e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
