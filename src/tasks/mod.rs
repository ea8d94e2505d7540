//! Background Tasks Module
//!
//! Contains background tasks that run independently of client traffic.
//!
//! # Tasks
//! - Failure detection: probes peers and publishes membership events
//! - Ring logging: reports every published ring snapshot

mod failure_detector;

pub use failure_detector::{
    spawn_failure_detector, spawn_ring_logger, FailureDetector, ProbeSettings, Prober,
};
