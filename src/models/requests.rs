//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use bytes::Bytes;
use serde::Deserialize;

use crate::cache::expiry_from_exptime;
use crate::error::CacheError;
use crate::replication::Command;

/// memcached verb carried by a [`CommandRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    Set,
    Add,
    Delete,
    Get,
    Gets,
    Cas,
}

/// Request body for POST /v1/command
///
/// # Fields
/// - `op`: memcached verb
/// - `key`: cache key
/// - `value`: required by `set`, `add` and `cas`
/// - `exptime`: memcached expiry (0 = never, up to 30 days = relative
///   seconds, larger = absolute unix seconds, negative = already expired)
/// - `cas`: version token from an earlier `gets`, required by `cas`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub op: CommandOp,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub exptime: Option<i64>,
    #[serde(default)]
    pub cas: Option<u64>,
}

impl CommandRequest {
    /// Decodes the request into a validated [`Command`]. `now_ms` anchors
    /// relative expiry times.
    pub fn into_command(self, now_ms: u64) -> Result<Command, CacheError> {
        let key = Bytes::from(self.key);
        let expiry = expiry_from_exptime(self.exptime.unwrap_or(0), now_ms);
        let op = self.op;
        let value = || {
            self.value
                .clone()
                .map(Bytes::from)
                .ok_or_else(|| CacheError::InvalidRequest(format!("{op:?} requires a value")))
        };

        let command = match op {
            CommandOp::Set => Command::Set {
                key,
                value: value()?,
                expiry,
            },
            CommandOp::Add => Command::Add {
                key,
                value: value()?,
                expiry,
            },
            CommandOp::Cas => Command::CompareAndSet {
                key,
                value: value()?,
                expiry,
                expected_version: self.cas.ok_or_else(|| {
                    CacheError::InvalidRequest("cas requires a version token".to_string())
                })?,
            },
            CommandOp::Delete => Command::Delete { key },
            CommandOp::Get => Command::Get { key },
            CommandOp::Gets => Command::Gets { key },
        };
        command.validate()?;
        Ok(command)
    }
}
