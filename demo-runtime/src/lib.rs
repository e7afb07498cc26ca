//! Lease lifecycle core for on-demand demo instances.
//!
//! This crate owns the state machine that provisions short-lived instances
//! from templates, persists their leases, and guarantees each one is torn
//! down once its lease runs out, including after a process restart. The
//! container runtime and the lease store are reached through the
//! [`runtime::RuntimeClient`] and [`store::LeaseStore`] traits so that the
//! orchestrator and scheduler never touch a global handle.

pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod orchestrator;
pub mod provision_progress;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod util;

pub use config::{DiscoveryConfig, LeaseConfig, QuotaConfig};
pub use discovery::{AddressDiscovery, AddressFamily};
pub use error::LeaseError;
pub use lease::{Lease, LeaseResult, LeaseState, LeaseStatus};
pub use orchestrator::LifecycleOrchestrator;
pub use runtime::RuntimeClient;
pub use scheduler::ExpiryScheduler;
pub use store::LeaseStore;

pub const DEFAULT_FQDN_SUFFIX: &str = ".lxd";
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 1800;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Address recorded for leases created while network access is disabled.
pub const CONSOLE_ONLY_ADDRESS: &str = "console-only";
