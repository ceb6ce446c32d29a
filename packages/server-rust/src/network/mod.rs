//! Networking: configuration, router assembly, lifecycle, and handlers.

pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod module;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use lifecycle::{ExecutionStats, HealthState, Lifecycle};
pub use module::NetworkModule;
