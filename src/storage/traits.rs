// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One storage medium in the tier hierarchy.
///
/// Declaration order is the nominal speed order (fastest first) and is used
/// as a tie-breaker wherever tiers are sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Ephemeral,
    FastLocal,
    BulkLocal,
    RemoteServer,
    RemoteObject,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Ephemeral,
        BackendKind::FastLocal,
        BackendKind::BulkLocal,
        BackendKind::RemoteServer,
        BackendKind::RemoteObject,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::FastLocal => "fast-local",
            Self::BulkLocal => "bulk-local",
            Self::RemoteServer => "remote-server",
            Self::RemoteObject => "remote-object",
        }
    }

    /// Remote tiers go over the network and are protected by circuit breakers.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteServer | Self::RemoteObject)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`StorageError`], used by retry allow-lists
/// and by the router when deciding whether a failure affects health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    CapacityExceeded,
    SchemaVersionMismatch,
    CircuitOpen,
    Serialization,
    Backend,
    NotConfigured,
    InvalidConfig,
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("transient I/O failure on {backend}: {message}")]
    TransientIo { backend: BackendKind, message: String },

    #[error("capacity exceeded on {backend}: {requested} bytes requested, limit {limit}")]
    CapacityExceeded {
        backend: BackendKind,
        requested: u64,
        limit: u64,
    },

    #[error("schema version mismatch: record has '{found}', expected '{expected}'")]
    SchemaVersionMismatch { found: String, expected: String },

    #[error("circuit '{circuit}' open, retry after {retry_after:?}")]
    CircuitOpen { circuit: String, retry_after: Duration },

    #[error("operation '{operation}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<StorageError>,
    },

    #[error("all storage options failed for '{key}' (tried {})", format_tried(.tried))]
    AllBackendsFailed {
        key: String,
        tried: Vec<(BackendKind, String)>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("backend {0} is not configured")]
    NotConfigured(BackendKind),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn format_tried(tried: &[(BackendKind, String)]) -> String {
    if tried.is_empty() {
        return "nothing".to_string();
    }
    tried
        .iter()
        .map(|(kind, err)| format!("{kind}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::SchemaVersionMismatch { .. } => ErrorKind::SchemaVersionMismatch,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetriesExhausted { last, .. } => last.kind(),
            Self::AllBackendsFailed { .. } => ErrorKind::Backend,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Backend(_) => ErrorKind::Backend,
            Self::NotConfigured(_) => ErrorKind::NotConfigured,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Whether this failure says something about the backend's health
    /// (as opposed to the caller's payload or data).
    #[must_use]
    pub fn is_health_affecting(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientIo | ErrorKind::CircuitOpen | ErrorKind::Backend
        )
    }

    pub(crate) fn serialization(err: impl fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Capacity report for a single backend. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub max_size: u64,
    /// Fraction of `max_size` (0.0 - 1.0) above which the tier is "warning".
    pub warning_threshold: f64,
    pub used: u64,
}

impl StorageQuota {
    #[must_use]
    pub fn usage_ratio(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.used as f64 / self.max_size as f64
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.usage_ratio() >= self.warning_threshold
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.max_size.saturating_sub(self.used)
    }
}

/// Serialized size of a payload, used for routing and quota estimates.
pub fn payload_size(value: &Value) -> Result<u64, StorageError> {
    Ok(serde_json::to_vec(value)?.len() as u64)
}

/// Uniform contract every storage tier implements.
///
/// `get` misses are `Ok(None)`. Failures of `set`/`remove` are surfaced so
/// the router can count them against the backend's health.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap capability check (connectivity, store reachable).
    async fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn list(&self) -> Result<Vec<String>, StorageError>;
    async fn quota(&self) -> Result<StorageQuota, StorageError>;

    /// Backend-specific reclamation. Returns the number of entries removed.
    async fn cleanup(&self) -> Result<usize, StorageError>;
}
