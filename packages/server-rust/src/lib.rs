//! Gatehouse server: an axum request pipeline that correlates, traces,
//! authenticates, and logs every request, then runs its handler under a
//! deadline with panic isolation.

pub mod network;
pub mod service;
pub mod telemetry;

pub use network::{NetworkConfig, NetworkModule};
pub use service::{build_pipeline_layers, Deadline, PipelineConfig};
