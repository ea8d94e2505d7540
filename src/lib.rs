//! distcache - A distributed in-memory cache node
//!
//! Keys are placed on a consistent-hash ring, replicated to `N` nodes with
//! quorum reads and writes, and held in per-node LRU stores with
//! memcached-style expiry.

pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod replication;
pub mod ring;
pub mod tasks;

pub use api::AppState;
pub use cluster::{CacheNode, ClusterSettings};
pub use config::Config;
pub use replication::{Command, Response};
