//! Lease control plane server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blueprint_sdk::{error, info};
use demo_runtime::metrics::LeaseMetrics;
use demo_runtime::runtime::lxd::{LxdClient, LxdConfig};
use demo_runtime::store::LocalLeaseStore;
use demo_runtime::{ExpiryScheduler, LeaseConfig, LeaseError, LifecycleOrchestrator};
use demo_server_lib::{AppState, ServerConfig, api_router};

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("failed to connect to LXD: {0}")]
    Runtime(LeaseError),
    #[error("failed to open lease store: {0}")]
    Store(LeaseError),
    #[error("startup recovery failed: {0}")]
    Recovery(LeaseError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    setup_log();

    let lease_config = LeaseConfig::from_env();
    let server_config = ServerConfig::from_env();
    let lxd_config = LxdConfig::from_env();

    info!(
        "Starting lease server (duration={}s, network={}, lxd={})",
        lease_config.lease_duration_secs, lease_config.network_enabled, lxd_config.url
    );

    let runtime = Arc::new(LxdClient::new(&lxd_config).map_err(ServerError::Runtime)?);
    let store = Arc::new(LocalLeaseStore::open(&lease_config.state_dir).map_err(ServerError::Store)?);
    let metrics = Arc::new(LeaseMetrics::new());

    let scheduler = Arc::new(ExpiryScheduler::new(
        runtime.clone(),
        store.clone(),
        metrics.clone(),
    ));

    // Past-due leases must be gone before the first request can reuse
    // their names.
    scheduler
        .recover_on_startup()
        .await
        .map_err(ServerError::Recovery)?;

    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        runtime,
        store,
        scheduler,
        lease_config,
        metrics,
    ));

    if server_config.reconcile_interval_secs > 0 {
        let orchestrator = orchestrator.clone();
        let every = Duration::from_secs(server_config.reconcile_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match orchestrator.reap_leaked_instances().await {
                    Ok(0) => {}
                    Ok(reaped) => info!("reconcile: removed {reaped} leaked instance(s)"),
                    Err(err) => error!("reconcile: pass failed: {err}"),
                }
            }
        });
    }

    {
        let orchestrator = orchestrator.clone();
        let max_age = server_config.provision_gc_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                orchestrator.progress().gc(max_age);
            }
        });
    }

    let addr = server_config.api_addr;
    let router = api_router(AppState {
        orchestrator,
        config: Arc::new(server_config),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!("Lease API listening on {addr}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(ServerError::Serve)?;

    info!("Lease server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
    }
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
