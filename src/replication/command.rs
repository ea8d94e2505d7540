//! Decoded client commands and responses.
//!
//! The command set is a closed enum: adding a command kind forces every
//! match over it to be revisited.

use bytes::Bytes;
use serde::Serialize;

use crate::cache::{MAX_KEY_LENGTH, MAX_VALUE_SIZE};
use crate::error::CacheError;

/// A decoded client command. Expiries are absolute unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set {
        key: Bytes,
        value: Bytes,
        expiry: Option<u64>,
    },
    Add {
        key: Bytes,
        value: Bytes,
        expiry: Option<u64>,
    },
    Delete {
        key: Bytes,
    },
    Get {
        key: Bytes,
    },
    Gets {
        key: Bytes,
    },
    CompareAndSet {
        key: Bytes,
        value: Bytes,
        expiry: Option<u64>,
        expected_version: u64,
    },
}

impl Command {
    pub fn key(&self) -> &Bytes {
        match self {
            Command::Set { key, .. }
            | Command::Add { key, .. }
            | Command::Delete { key }
            | Command::Get { key }
            | Command::Gets { key }
            | Command::CompareAndSet { key, .. } => key,
        }
    }

    /// memcached verb for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Add { .. } => "add",
            Command::Delete { .. } => "delete",
            Command::Get { .. } => "get",
            Command::Gets { .. } => "gets",
            Command::CompareAndSet { .. } => "cas",
        }
    }

    /// Checks key and value limits before the command touches any replica.
    pub fn validate(&self) -> Result<(), CacheError> {
        validate_key(self.key())?;
        match self {
            Command::Set { value, .. }
            | Command::Add { value, .. }
            | Command::CompareAndSet { value, .. } => validate_value(value),
            Command::Delete { .. } | Command::Get { .. } | Command::Gets { .. } => Ok(()),
        }
    }
}

/// Keys are 1..=250 bytes without whitespace or control characters.
pub fn validate_key(key: &[u8]) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(CacheError::InvalidRequest(
            "Key cannot contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), CacheError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(CacheError::InvalidRequest(format!(
            "Value exceeds maximum size of {} bytes",
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

/// Why a storage command was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotStoredReason {
    AlreadyExists,
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    NotStored(NotStoredReason),
    Deleted,
    NotFound,
    Value(Bytes),
    ValueWithVersion(Bytes, u64),
    Unavailable,
    Conflict,
}

impl Response {
    /// memcached-style status word.
    pub fn status(&self) -> &'static str {
        match self {
            Response::Stored => "STORED",
            Response::NotStored(_) => "NOT_STORED",
            Response::Deleted => "DELETED",
            Response::NotFound => "NOT_FOUND",
            Response::Value(_) | Response::ValueWithVersion(..) => "VALUE",
            Response::Unavailable => "UNAVAILABLE",
            Response::Conflict => "EXISTS",
        }
    }
}
