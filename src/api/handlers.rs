//! API Handlers
//!
//! HTTP request handlers for the client command endpoint, the internal
//! peer endpoints and the operational endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::debug;

use crate::cache::current_timestamp_ms;
use crate::cluster::CacheNode;
use crate::error::Result;
use crate::models::{
    CommandRequest, CommandResponse, HealthResponse, MembershipChangeResponse, PingResponse,
    RingResponse, StatsResponse,
};
use crate::replication::{ReplicaReply, ReplicaRequest};
use crate::ring::MembershipEvent;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<CacheNode>,
}

impl AppState {
    pub fn new(node: Arc<CacheNode>) -> Self {
        Self { node }
    }
}

/// Handler for POST /v1/command
///
/// Decodes a memcached-style command, runs it against the key's replica set
/// and maps the outcome to an HTTP status.
pub async fn command_handler(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandResponse>)> {
    let command = req.into_command(current_timestamp_ms())?;
    let response = state.node.execute(command).await?;
    let (status, body) = CommandResponse::from_response(response);
    Ok((status, Json(body)))
}

/// Handler for POST /internal/v1/replica
///
/// Applies a peer coordinator's sub-operation to the local store.
pub async fn replica_handler(
    State(state): State<AppState>,
    Json(req): Json<ReplicaRequest>,
) -> Json<ReplicaReply> {
    Json(state.node.local_replica().handle(req).await)
}

/// Handler for GET /internal/v1/ping
pub async fn ping_handler(State(state): State<AppState>) -> Json<PingResponse> {
    Json(PingResponse {
        node: state.node.local_id().clone(),
        ring_version: state.node.membership().current_version(),
    })
}

/// Handler for POST /internal/v1/membership
///
/// Peers announce their own joins and departures here.
pub async fn membership_handler(
    State(state): State<AppState>,
    Json(event): Json<MembershipEvent>,
) -> Json<MembershipChangeResponse> {
    debug!(?event, "Membership announcement received");
    Json(MembershipChangeResponse {
        ring_version: state.node.on_membership_change(event),
    })
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let node = &state.node;
    Json(StatsResponse::new(
        node.local_id().clone(),
        node.membership().current_version(),
        node.store_stats().await,
        node.replication_stats(),
    ))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.node.local_id().clone()))
}

#[derive(Debug, Deserialize)]
pub struct RingQuery {
    pub key: Option<String>,
}

/// Handler for GET /v1/ring
///
/// Returns the current ring snapshot, plus the replica set of `?key=` when
/// given.
pub async fn ring_handler(
    State(state): State<AppState>,
    Query(query): Query<RingQuery>,
) -> Json<RingResponse> {
    let snapshot = state.node.membership().snapshot();
    let replication_factor = state.node.settings().quorum.replication_factor;
    let replicas = query
        .key
        .map(|key| snapshot.replicas_for(key.as_bytes(), replication_factor).nodes);
    Json(RingResponse::new(&snapshot, replicas))
}
