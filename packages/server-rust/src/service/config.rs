//! Configuration for the request pipeline.
//!
//! Every component receives its own slice of configuration by value at
//! construction time; nothing reads the environment at request time.

use std::collections::HashSet;
use std::time::Duration;

use gatehouse_core::redaction::DEFAULT_CAPTURE_LIMIT;
use gatehouse_core::RedactionPolicy;

/// Environment name that selects production logging behaviour.
pub const PRODUCTION_ENV: &str = "production";

/// Aggregate configuration for every pipeline stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Deployment environment name (`development`, `staging`, `production`, ...).
    pub environment: String,
    pub auth: AuthConfig,
    pub tracing: TracingConfig,
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            auth: AuthConfig::default(),
            tracing: TracingConfig::default(),
            capture: CaptureConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == PRODUCTION_ENV
    }
}

/// Bearer-credential validation settings.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC secret used to verify credential signatures.
    pub secret: Vec<u8>,
    /// Request paths that bypass authentication entirely.
    pub skip_paths: HashSet<String>,
    /// Clock skew tolerated when checking expiry.
    pub leeway: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: Vec::new(),
            skip_paths: ["/health", "/health/live", "/health/ready", "/metrics"]
                .into_iter()
                .map(String::from)
                .collect(),
            leeway: Duration::ZERO,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }
}

// Keeps the signing secret out of debug output.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("skip_paths", &self.skip_paths)
            .field("leeway", &self.leeway)
            .finish()
    }
}

/// Request span settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub enabled: bool,
    /// Recorded as the `service` attribute of every request span.
    pub service_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "gatehouse".to_string(),
        }
    }
}

/// Body capture and logging settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Log redacted request and response bodies.
    pub log_bodies: bool,
    /// Hard cap on captured and logged body bytes.
    pub capture_limit: usize,
    /// Largest request body buffered for logging before rejecting with 413.
    pub max_request_body: usize,
    pub redaction: RedactionPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_bodies: false,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            max_request_body: 10 * 1024 * 1024,
            redaction: RedactionPolicy::default(),
        }
    }
}

/// Execution supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Include the panic value and its type in 500 responses.
    pub expose_panic_details: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            expose_panic_details: false,
        }
    }
}
