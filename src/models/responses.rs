//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::replication::{NotStoredReason, ReplicationStatsSnapshot, Response};
use crate::ring::{Member, NodeId, RingSnapshot};

/// Response body for POST /v1/command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// memcached status word (STORED, NOT_STORED, VALUE, ...)
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Version token, only returned by `gets`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cas: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandResponse {
    /// HTTP status paired with the body.
    pub fn from_response(response: Response) -> (StatusCode, Self) {
        let status = response.status().to_string();
        let mut body = Self {
            status,
            value: None,
            cas: None,
            reason: None,
        };

        let code = match response {
            Response::Stored | Response::Deleted => StatusCode::OK,
            Response::Value(value) => {
                body.value = Some(String::from_utf8_lossy(&value).into_owned());
                StatusCode::OK
            }
            Response::ValueWithVersion(value, version) => {
                body.value = Some(String::from_utf8_lossy(&value).into_owned());
                body.cas = Some(version);
                StatusCode::OK
            }
            Response::NotFound => StatusCode::NOT_FOUND,
            Response::NotStored(reason) => {
                body.reason = Some(
                    match reason {
                        NotStoredReason::AlreadyExists => "already_exists",
                    }
                    .to_string(),
                );
                StatusCode::CONFLICT
            }
            Response::Conflict => StatusCode::CONFLICT,
            Response::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, body)
    }
}

/// Local store counters plus the hit rate.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatsResponse {
    #[serde(flatten)]
    pub counters: CacheStats,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub node: NodeId,
    pub ring_version: u64,
    pub store: StoreStatsResponse,
    pub replication: ReplicationStatsSnapshot,
}

impl StatsResponse {
    pub fn new(
        node: NodeId,
        ring_version: u64,
        store: CacheStats,
        replication: ReplicationStatsSnapshot,
    ) -> Self {
        Self {
            node,
            ring_version,
            store: StoreStatsResponse {
                hit_rate: store.hit_rate(),
                counters: store,
            },
            replication,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    pub node: NodeId,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(node: NodeId) -> Self {
        Self {
            status: "healthy".to_string(),
            node,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Response body for the liveness probe (GET /internal/v1/ping)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub node: NodeId,
    pub ring_version: u64,
}

/// Response body for POST /internal/v1/membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChangeResponse {
    pub ring_version: u64,
}

/// Response body for GET /v1/ring
#[derive(Debug, Clone, Serialize)]
pub struct RingResponse {
    pub version: u64,
    pub members: Vec<Member>,
    /// Replica set of the `key` query parameter, when given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<Vec<NodeId>>,
}

impl RingResponse {
    pub fn new(snapshot: &RingSnapshot, replicas: Option<Vec<NodeId>>) -> Self {
        Self {
            version: snapshot.version(),
            members: snapshot.members().cloned().collect(),
            replicas,
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
