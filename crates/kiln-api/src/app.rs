use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health & metrics
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        // Host admission
        .route("/v1/hosts/:host_id/register", post(handlers::register_host))
        .route("/v1/hosts/:host_id/heartbeat", post(handlers::heartbeat))
        .route("/v1/hosts/:host_id/disable", post(handlers::disable_host))
        .route("/v1/hosts/:host_id/enable", post(handlers::enable_host))
        .route("/v1/hosts", get(handlers::get_hosts))
        // Agent callback
        .route("/v1/vms/:vm_id/status", post(handlers::vm_status))
        // Leases & audit feed
        .route("/v1/leases", get(handlers::get_leases))
        .route("/v1/leases/:lease_id/terminate", post(handlers::terminate_lease))
        .route("/v1/events", get(handlers::get_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
