//! API Routes
//!
//! Configures the Axum router with all cache node endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    command_handler, health_handler, membership_handler, ping_handler, replica_handler,
    ring_handler, stats_handler, AppState,
};
use crate::replication::{MEMBERSHIP_PATH, PING_PATH, REPLICA_PATH};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `POST /v1/command` - Run a set/add/delete/get/gets/cas command
/// - `GET /v1/ring` - Current ring snapshot
/// - `POST /internal/v1/replica` - Replica sub-operation from a peer
/// - `GET /internal/v1/ping` - Liveness probe
/// - `POST /internal/v1/membership` - Membership announcement from a peer
/// - `GET /stats` - Store and replication statistics
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/command", post(command_handler))
        .route("/v1/ring", get(ring_handler))
        .route(REPLICA_PATH, post(replica_handler))
        .route(PING_PATH, get(ping_handler))
        .route(MEMBERSHIP_PATH, post(membership_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
