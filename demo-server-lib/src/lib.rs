//! HTTP front for the demo instance lease control plane.
//!
//! Wraps a [`demo_runtime::LifecycleOrchestrator`] in an axum router and adds
//! the admission policy (maintenance, banned origins, capacity caps) that
//! sits outside the lifecycle core.

pub mod admission;
pub mod api;
pub mod config;

pub use admission::Admission;
pub use api::{AppState, api_router};
pub use config::ServerConfig;
