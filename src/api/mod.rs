//! API Module
//!
//! HTTP handlers and routing for the cache node.
//!
//! # Endpoints
//! - `POST /v1/command` - Client commands (set, add, delete, get, gets, cas)
//! - `GET /v1/ring` - Ring snapshot and key placement
//! - `/internal/v1/*` - Peer traffic: replica sub-operations, probes, membership
//! - `GET /stats` - Store and replication statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
