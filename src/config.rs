// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for batch-vault.
//!
//! Every backend except the ephemeral tier is optional; a tier that is not
//! configured is simply not registered with the router.
//!
//! # Example
//!
//! ```
//! use batch_vault::{BackendKind, StorageConfig};
//! use batch_vault::config::{BulkLocalConfig, RemoteServerConfig};
//!
//! // Minimal config: ephemeral tier only
//! let config = StorageConfig::default();
//! assert_eq!(config.routing.primary, BackendKind::BulkLocal);
//!
//! // Local SQLite plus the application server
//! let config = StorageConfig {
//!     bulk_local: Some(BulkLocalConfig {
//!         url: "sqlite://vault.db?mode=rwc".into(),
//!         ..Default::default()
//!     }),
//!     remote_server: Some(RemoteServerConfig {
//!         base_url: "https://api.example.com".into(),
//!         ..Default::default()
//!     }),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryPolicy;
use crate::router::rules::{default_rules, StorageRule};
use crate::storage::traits::{BackendKind, StorageError};

/// Serde adapter for `Duration` fields expressed as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub ephemeral: EphemeralConfig,

    #[serde(default)]
    pub fast_local: Option<FastLocalConfig>,

    #[serde(default)]
    pub bulk_local: Option<BulkLocalConfig>,

    #[serde(default)]
    pub remote_server: Option<RemoteServerConfig>,

    #[serde(default)]
    pub remote_object: Option<RemoteObjectConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Call-level retry for remote tiers
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Breaker settings shared by the per-backend circuits
    #[serde(default)]
    pub circuit: CircuitConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ephemeral: EphemeralConfig::default(),
            fast_local: None,
            bulk_local: None,
            remote_server: None,
            remote_object: None,
            routing: RoutingConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// In-process LRU tier.
#[derive(Debug, Clone, Deserialize)]
pub struct EphemeralConfig {
    #[serde(default = "default_ephemeral_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ephemeral_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Nominal capacity reported by `quota()`
    #[serde(default = "default_ephemeral_max_bytes")]
    pub max_size_bytes: u64,
}

/// Small persistent key/value tier backed by a single JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct FastLocalConfig {
    pub path: PathBuf,
    #[serde(default = "default_fast_local_max_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_fast_local_max_item_bytes")]
    pub max_item_bytes: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_fast_local_max_age_ms")]
    pub max_age_ms: u64,
}

/// Larger persistent tier backed by SQLite.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkLocalConfig {
    /// SQL connection string (e.g., "sqlite:///var/lib/app/vault.db?mode=rwc")
    pub url: String,
    #[serde(default = "default_bulk_local_max_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_bulk_local_max_item_bytes")]
    pub max_item_bytes: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_bulk_local_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Application backend reachable over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteServerConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Object store reachable over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteObjectConfig {
    pub base_url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// zstd-compress payloads before upload (needs the `compression` feature)
    #[serde(default = "default_true")]
    pub compress: bool,
    /// 64 hex chars; when set, payloads are encrypted with AES-256-GCM
    #[serde(default)]
    pub encryption_key_hex: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_remote_object_max_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_remote_object_max_age_ms")]
    pub max_age_ms: u64,
}

/// Write-target selection.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<StorageRule>,
    #[serde(default = "default_primary")]
    pub primary: BackendKind,
    #[serde(default = "default_fallbacks")]
    pub fallbacks: Vec<BackendKind>,
}

/// Background probing and health scoring.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Probe latency at or above this marks a backend unresponsive
    #[serde(default = "default_responsive_threshold_ms")]
    pub responsive_threshold_ms: u64,
    /// EWMA error rate at or above this marks a backend unresponsive
    #[serde(default = "default_error_rate_ceiling")]
    pub error_rate_ceiling: f64,
    #[serde(default = "default_error_rate_alpha")]
    pub error_rate_alpha: f64,
    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,
}

/// Recovery orchestrator defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Sources consulted in order
    #[serde(default = "default_source_order")]
    pub source_order: Vec<BackendKind>,
}

fn default_ephemeral_max_entries() -> usize { 1000 }
fn default_ephemeral_ttl_ms() -> u64 { 60 * 60 * 1000 } // 1 hour
fn default_sweep_interval_ms() -> u64 { 60 * 1000 }
fn default_ephemeral_max_bytes() -> u64 { 16 * 1024 * 1024 } // 16 MB
fn default_fast_local_max_bytes() -> u64 { 5 * 1024 * 1024 } // 5 MB
fn default_fast_local_max_item_bytes() -> u64 { 1024 * 1024 } // 1 MB
fn default_fast_local_max_age_ms() -> u64 { 7 * 24 * 60 * 60 * 1000 } // 7 days
fn default_bulk_local_max_bytes() -> u64 { 512 * 1024 * 1024 } // 512 MB
fn default_bulk_local_max_item_bytes() -> u64 { 50 * 1024 * 1024 } // 50 MB
fn default_bulk_local_max_age_ms() -> u64 { 30 * 24 * 60 * 60 * 1000 } // 30 days
fn default_max_connections() -> u32 { 4 }
fn default_warning_threshold() -> f64 { 0.8 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_bucket() -> String { "batch-vault".to_string() }
fn default_true() -> bool { true }
fn default_remote_object_max_bytes() -> u64 { 10 * 1024 * 1024 * 1024 } // 10 GB
fn default_remote_object_max_age_ms() -> u64 { 90 * 24 * 60 * 60 * 1000 } // 90 days
fn default_primary() -> BackendKind { BackendKind::BulkLocal }
fn default_fallbacks() -> Vec<BackendKind> {
    vec![BackendKind::FastLocal, BackendKind::RemoteServer, BackendKind::RemoteObject]
}
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_responsive_threshold_ms() -> u64 { 1000 }
fn default_error_rate_ceiling() -> f64 { 0.5 }
fn default_error_rate_alpha() -> f64 { 0.2 }
fn default_latency_alpha() -> f64 { 0.3 }
fn default_recovery_timeout_ms() -> u64 { 30_000 }
fn default_source_order() -> Vec<BackendKind> {
    vec![BackendKind::FastLocal, BackendKind::BulkLocal, BackendKind::RemoteServer]
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            max_entries: default_ephemeral_max_entries(),
            default_ttl_ms: default_ephemeral_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_size_bytes: default_ephemeral_max_bytes(),
        }
    }
}

impl FastLocalConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_bytes: default_fast_local_max_bytes(),
            max_item_bytes: default_fast_local_max_item_bytes(),
            warning_threshold: default_warning_threshold(),
            max_age_ms: default_fast_local_max_age_ms(),
        }
    }
}

impl Default for BulkLocalConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_size_bytes: default_bulk_local_max_bytes(),
            max_item_bytes: default_bulk_local_max_item_bytes(),
            warning_threshold: default_warning_threshold(),
            max_age_ms: default_bulk_local_max_age_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RemoteObjectConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            bucket: default_bucket(),
            auth_token: None,
            compress: default_true(),
            encryption_key_hex: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_size_bytes: default_remote_object_max_bytes(),
            max_age_ms: default_remote_object_max_age_ms(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            primary: default_primary(),
            fallbacks: default_fallbacks(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_health_check_interval_ms(),
            responsive_threshold_ms: default_responsive_threshold_ms(),
            error_rate_ceiling: default_error_rate_ceiling(),
            error_rate_alpha: default_error_rate_alpha(),
            latency_alpha: default_latency_alpha(),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub fn responsive_threshold(&self) -> Duration {
        Duration::from_millis(self.responsive_threshold_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_recovery_timeout_ms(),
            source_order: default_source_order(),
        }
    }
}

fn unit_interval(name: &str, value: f64) -> Result<(), StorageError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(StorageError::InvalidConfig(format!("{name} must be in (0, 1], got {value}")))
    }
}

fn item_within_total(kind: BackendKind, item: u64, total: u64) -> Result<(), StorageError> {
    if item == 0 || item > total {
        return Err(StorageError::InvalidConfig(format!(
            "{kind}: max_item_bytes ({item}) must be non-zero and not exceed max_size_bytes ({total})"
        )));
    }
    Ok(())
}

impl StorageConfig {
    /// Reject inconsistent thresholds before anything is opened.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.ephemeral.max_entries == 0 {
            return Err(StorageError::InvalidConfig("ephemeral.max_entries must be > 0".into()));
        }
        if let Some(fast) = &self.fast_local {
            item_within_total(BackendKind::FastLocal, fast.max_item_bytes, fast.max_size_bytes)?;
            unit_interval("fast_local.warning_threshold", fast.warning_threshold)?;
        }
        if let Some(bulk) = &self.bulk_local {
            item_within_total(BackendKind::BulkLocal, bulk.max_item_bytes, bulk.max_size_bytes)?;
            unit_interval("bulk_local.warning_threshold", bulk.warning_threshold)?;
            if bulk.max_connections == 0 {
                return Err(StorageError::InvalidConfig("bulk_local.max_connections must be > 0".into()));
            }
        }
        if let Some(object) = &self.remote_object {
            if object.bucket.is_empty() || object.bucket.contains('/') {
                return Err(StorageError::InvalidConfig(format!(
                    "remote_object.bucket '{}' is not a valid bucket name",
                    object.bucket
                )));
            }
        }

        unit_interval("health.error_rate_ceiling", self.health.error_rate_ceiling)?;
        unit_interval("health.error_rate_alpha", self.health.error_rate_alpha)?;
        unit_interval("health.latency_alpha", self.health.latency_alpha)?;
        if self.health.check_interval_ms == 0 {
            return Err(StorageError::InvalidConfig("health.check_interval_ms must be > 0".into()));
        }

        if self.routing.rules.iter().any(|rule| rule.max_size == 0) {
            return Err(StorageError::InvalidConfig("routing rule max_size must be > 0".into()));
        }
        if self.recovery.source_order.is_empty() {
            return Err(StorageError::InvalidConfig("recovery.source_order must not be empty".into()));
        }
        if self.recovery.source_order.contains(&BackendKind::Ephemeral) {
            return Err(StorageError::InvalidConfig(
                "recovery.source_order cannot include the ephemeral tier".into(),
            ));
        }

        if self.retry.max_retries == 0 {
            return Err(StorageError::InvalidConfig("retry.max_retries must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(StorageError::InvalidConfig("retry.jitter_factor must be in [0, 1]".into()));
        }
        if self.retry.base_delay > self.retry.max_backoff_delay {
            return Err(StorageError::InvalidConfig(
                "retry.base_delay_ms must not exceed retry.max_backoff_delay_ms".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(StorageError::InvalidConfig("circuit.failure_threshold must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ephemeral.max_entries, 1000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(
            config.recovery.source_order,
            vec![BackendKind::FastLocal, BackendKind::BulkLocal, BackendKind::RemoteServer]
        );
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "fast_local": { "path": "/tmp/vault.json" },
            "remote_server": { "base_url": "http://api.local" },
            "health": { "error_rate_ceiling": 0.3 },
            "retry": { "max_retries": 5, "base_delay_ms": 50 },
            "circuit": { "reset_timeout_ms": 1000 },
            "routing": { "primary": "fast-local" }
        }))
        .unwrap();

        let fast = config.fast_local.as_ref().unwrap();
        assert_eq!(fast.max_item_bytes, 1024 * 1024);
        assert_eq!(config.remote_server.as_ref().unwrap().request_timeout_ms, 10_000);
        assert!((config.health.error_rate_ceiling - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.health.check_interval_ms, 30_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.circuit.reset_timeout, Duration::from_secs(1));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.routing.primary, BackendKind::FastLocal);
        assert_eq!(config.routing.rules.len(), 4);
    }

    #[test]
    fn test_rejects_item_larger_than_total() {
        let mut fast = FastLocalConfig::at("/tmp/x.json");
        fast.max_item_bytes = fast.max_size_bytes + 1;
        let config = StorageConfig {
            fast_local: Some(fast),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_ratios() {
        let mut config = StorageConfig::default();
        config.health.error_rate_ceiling = 1.5;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.retry.jitter_factor = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_ephemeral_recovery_source() {
        let mut config = StorageConfig::default();
        config.recovery.source_order = vec![BackendKind::Ephemeral];
        assert!(config.validate().is_err());
    }
}
