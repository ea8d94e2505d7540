//! Error types for the cache node
//!
//! Provides unified error handling using thiserror. Store and peer errors are
//! ordinary outcomes of replication; only `CacheError` reaches HTTP clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::ring::NodeId;

// == Store Error Enum ==
/// Rejections produced by a single node's LRU store.
///
/// None of these are faults: they are the normal answers of conditional
/// writes and are shipped verbatim between peers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreError {
    /// Key absent or expired
    #[error("key not found")]
    NotFound,

    /// `add` on a live key
    #[error("key already exists")]
    AlreadyExists,

    /// Stored version differs from the expected one
    #[error("version mismatch (current: {current:?})")]
    VersionMismatch { current: Option<u64> },

    /// A write at an equal or newer version is already stored
    #[error("write superseded by version {current}")]
    Superseded { current: u64 },
}

// == Peer Error Enum ==
/// Failures talking to another node. Internal only: they feed the failure
/// detector and collapse into `Unavailable` when they break a quorum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// No reply within the per-replica timeout
    #[error("peer {0} timed out")]
    Timeout(NodeId),

    /// Connection refused, reset, or a non-success HTTP status
    #[error("peer {0} unreachable: {1}")]
    Unreachable(NodeId, String),

    /// The peer answered with something we could not interpret
    #[error("peer {0} sent an invalid reply: {1}")]
    Protocol(NodeId, String),
}

impl PeerError {
    /// Node the failure is recorded against.
    pub fn node(&self) -> &NodeId {
        match self {
            PeerError::Timeout(node)
            | PeerError::Unreachable(node, _)
            | PeerError::Protocol(node, _) => node,
        }
    }
}

// == Config Error ==
/// Invalid cluster settings. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

// == Cache Error Enum ==
/// Errors surfaced through the HTTP API.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Node could not be configured
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::Config(_) | CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the API layer.
pub type Result<T> = std::result::Result<T, CacheError>;
