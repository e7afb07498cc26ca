//! Axum router for the lease API.
//!
//! Endpoints:
//! - `GET  /1.0` server status
//! - `POST /1.0/containers/{template}` provision a lease for `x-user-id`
//! - `GET  /1.0/leases/{lease_id}` look up an owned, non-expired lease
//! - `GET  /1.0/provisions[?active=true]` provisioning progress
//! - `GET  /1.0/metrics` lifecycle counters

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use blueprint_sdk::{error, warn};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use demo_runtime::{LeaseError, LeaseStatus, LifecycleOrchestrator};

use crate::admission::Admission;
use crate::config::ServerConfig;

/// Header carrying the authenticated caller, set by the fronting proxy.
pub const USER_HEADER: &str = "x-user-id";

const UNKNOWN_ORIGIN: &str = "unknown";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub config: Arc<ServerConfig>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

/// Rejection in the lease status vocabulary.
fn status_response(http: StatusCode, status: LeaseStatus) -> Response {
    (http, Json(serde_json::json!({ "status": status }))).into_response()
}

fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Request origin used for bans and per-origin caps: the peer address, or
/// the first `x-forwarded-for` hop when the proxy in front is trusted.
fn extract_client_ip(req: &Request, trust_forwarded_for: bool) -> Option<String> {
    let forwarded = || {
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let peer = || {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
    };
    if trust_forwarded_for {
        forwarded().or_else(peer)
    } else {
        peer()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn server_status(State(state): State<AppState>) -> Response {
    let active = match state.orchestrator.active_leases().await {
        Ok(leases) => leases.len(),
        Err(err) => {
            error!("api: failed to list leases: {err}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };
    let server_status = u8::from(state.config.maintenance);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "server_status": server_status,
            "instances_max": state.config.max_instances,
            "instances_active": active,
            "instances_provisioning": state.orchestrator.in_flight_count(),
        })),
    )
        .into_response()
}

async fn create_lease(
    State(state): State<AppState>,
    Path(template): Path<String>,
    request: Request,
) -> Response {
    let Some(owner) = caller(request.headers()) else {
        return api_error(StatusCode::UNAUTHORIZED, "Missing x-user-id");
    };
    let origin = extract_client_ip(&request, state.config.trust_forwarded_for)
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());

    let active = match state.orchestrator.active_leases().await {
        Ok(leases) => leases,
        Err(err) => {
            error!("api: failed to list leases: {err}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, LeaseStatus::UnknownError);
        }
    };
    let admitted = Admission::new(&state.config).check(
        &origin,
        &active,
        state.orchestrator.in_flight_count(),
    );
    match admitted {
        LeaseStatus::Started => {}
        LeaseStatus::UserBanned => {
            warn!("api: rejecting banned origin {origin}");
            return status_response(StatusCode::FORBIDDEN, admitted);
        }
        LeaseStatus::QuotaReached => {
            return status_response(StatusCode::TOO_MANY_REQUESTS, admitted);
        }
        _ => return status_response(StatusCode::SERVICE_UNAVAILABLE, admitted),
    }

    // Run on a separate task: a dropped connection must not cancel the flow
    // halfway and skip its compensating teardown.
    let orchestrator = state.orchestrator.clone();
    let flow = tokio::spawn(async move {
        orchestrator
            .provision_instance(&owner, &template, &origin)
            .await
    });

    match flow.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(result)).into_response(),
        // Detail stays in the log; callers only see the generic status.
        Ok(Err(err)) if err.is_provisioning_failure() => {
            status_response(StatusCode::INTERNAL_SERVER_ERROR, LeaseStatus::UnknownError)
        }
        Ok(Err(err)) => {
            warn!("api: rejected create request: {err}");
            status_response(StatusCode::BAD_REQUEST, LeaseStatus::UnknownError)
        }
        Err(err) => {
            error!("api: provisioning task failed: {err}");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, LeaseStatus::UnknownError)
        }
    }
}

async fn get_lease(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(owner) = caller(&headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "Missing x-user-id");
    };
    match state.orchestrator.lease(&lease_id).await {
        Ok(lease) if lease.owner_id == owner => {
            (StatusCode::OK, Json(state.orchestrator.lease_result(&lease))).into_response()
        }
        Ok(_) | Err(LeaseError::NotFound(_)) => {
            api_error(StatusCode::NOT_FOUND, "Lease not found")
        }
        Err(err) => {
            error!("api: failed to read lease {lease_id}: {err}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProvisionsQuery {
    /// Only flows that have not finished yet.
    #[serde(default)]
    active: bool,
}

async fn list_provisions(
    State(state): State<AppState>,
    Query(query): Query<ProvisionsQuery>,
) -> Response {
    let progress = state.orchestrator.progress();
    let provisions = if query.active {
        progress.list_active()
    } else {
        progress.list_all()
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({ "provisions": provisions })),
    )
        .into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let counters: serde_json::Map<String, serde_json::Value> = state
        .orchestrator
        .metrics()
        .snapshot()
        .into_iter()
        .map(|(key, value)| (key, value.into()))
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "metrics": counters }))).into_response()
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

/// Build the lease API router with CORS and request tracing.
pub fn api_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/1.0", get(server_status))
        .route("/1.0/containers/{template}", post(create_lease))
        .route("/1.0/leases/{lease_id}", get(get_lease))
        .route("/1.0/provisions", get(list_provisions))
        .route("/1.0/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
