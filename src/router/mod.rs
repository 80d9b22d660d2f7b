// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unified storage router.
//!
//! [`UnifiedStorage`] puts every registered tier behind one key/value
//! surface:
//! - writes go to the first healthy tier picked by size/type rules, then the
//!   primary, then the fallbacks, with the ephemeral tier as last resort
//! - reads try the ephemeral tier, then healthy tiers fastest first, and
//!   promote hits into the ephemeral tier
//! - deletes fan out to every tier
//!
//! A background loop probes each tier and keeps the [`HealthTable`] current.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_vault::{StorageConfig, SystemPlatform, UnifiedStorage};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), batch_vault::StorageError> {
//! let storage = Arc::new(UnifiedStorage::from_config(&StorageConfig::default(), Arc::new(SystemPlatform::new())).await?);
//! storage.start();
//!
//! let tier = storage.save("greeting", &json!("hello")).await?;
//! assert_eq!(storage.load("greeting").await, Some(json!("hello")));
//! println!("stored in {tier}");
//!
//! storage.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod health;
pub mod rules;
pub mod types;

pub use health::{HealthTable, StorageHealth};
pub use rules::StorageRule;
pub use types::{CleanupReport, DeleteReport, Loaded, OpKind, OpSnapshot, QuotaReport, SaveOptions, StorageMetrics, TierQuota};

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HealthConfig, RoutingConfig, StorageConfig};
use crate::metrics::LatencyTimer;
use crate::platform::Platform;
use crate::resilience::circuit_breaker::CircuitBreakerState;
use crate::storage::registry::BackendRegistry;
use crate::storage::remote_server::RemoteServerStore;
use crate::storage::traits::{payload_size, BackendKind, StorageBackend, StorageError};
use types::RouterCounters;

pub struct UnifiedStorage {
    registry: BackendRegistry,
    routing: RoutingConfig,
    health_config: HealthConfig,
    sweep_interval: Duration,
    health: HealthTable,
    counters: RouterCounters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnifiedStorage {
    /// Wrap an already assembled registry.
    pub fn new(registry: BackendRegistry, config: &StorageConfig) -> Self {
        let health = HealthTable::new(config.health.clone());
        for kind in registry.kinds() {
            health.register(kind);
        }
        Self {
            registry,
            routing: config.routing.clone(),
            health_config: config.health.clone(),
            sweep_interval: Duration::from_millis(config.ephemeral.sweep_interval_ms),
            health,
            counters: RouterCounters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open every configured tier and build the router over them.
    pub async fn from_config(config: &StorageConfig, platform: Arc<dyn Platform>) -> Result<Self, StorageError> {
        let registry = BackendRegistry::from_config(config, platform).await?;
        Ok(Self::new(registry, config))
    }

    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        self.registry.platform()
    }

    /// Application server handle, when that tier is configured.
    #[must_use]
    pub fn remote_server(&self) -> Option<&Arc<RemoteServerStore>> {
        self.registry.remote_server()
    }

    fn now(&self) -> i64 {
        self.platform().now_millis()
    }

    /// Time one backend call and feed metrics and health.
    async fn observe<T, Fut>(&self, kind: BackendKind, op: OpKind, call: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let timer = LatencyTimer::new(kind.as_str(), op.as_str());
        let result = call.await;
        let elapsed = timer.elapsed();

        self.counters.op(op).record(result.is_ok(), elapsed);
        let status = if result.is_ok() { "success" } else { "error" };
        crate::metrics::record_operation(kind.as_str(), op.as_str(), status);

        match &result {
            Ok(_) => self.health.record_outcome(kind, true, self.now()),
            Err(e) if e.is_health_affecting() => self.health.record_outcome(kind, false, self.now()),
            Err(_) => {}
        }
        result
    }

    /// Registered, reporting available, and healthy in the table.
    async fn usable_kinds(&self) -> HashSet<BackendKind> {
        let checks = self.registry.iter().map(|(kind, backend)| async move {
            let usable = self.health.is_healthy(kind) && backend.is_available().await;
            (kind, usable)
        });
        join_all(checks)
            .await
            .into_iter()
            .filter_map(|(kind, usable)| usable.then_some(kind))
            .collect()
    }

    fn ephemeral(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.registry.get(BackendKind::Ephemeral)
    }

    /// Store `value` under `key` using the default rules.
    pub async fn save(&self, key: &str, value: &Value) -> Result<BackendKind, StorageError> {
        self.save_with(key, value, SaveOptions::default()).await
    }

    /// Store `value` under `key`, trying candidates in order until one
    /// accepts it. Returns the tier that did.
    #[tracing::instrument(skip(self, value, options), fields(size))]
    pub async fn save_with(&self, key: &str, value: &Value, options: SaveOptions) -> Result<BackendKind, StorageError> {
        let size = payload_size(value)?;
        tracing::Span::current().record("size", size);

        let usable = self.usable_kinds().await;
        let candidates = rules::write_candidates(
            &self.routing.rules,
            size,
            options.data_type.as_deref(),
            options.preferred,
            self.routing.primary,
            &self.routing.fallbacks,
            |kind| usable.contains(&kind) || (kind == BackendKind::Ephemeral && self.registry.contains(kind)),
        );

        let mut tried: Vec<(BackendKind, String)> = Vec::new();
        for kind in candidates {
            let Some(backend) = self.registry.get(kind) else { continue };
            match self.observe(kind, OpKind::Write, backend.set(key, value)).await {
                Ok(()) => {
                    if !tried.is_empty() {
                        info!(key, backend = %kind, skipped = tried.len(), "Write landed on fallback tier");
                    }
                    if kind != BackendKind::Ephemeral {
                        self.invalidate_cached(key).await;
                    }
                    return Ok(kind);
                }
                Err(e) => {
                    warn!(key, backend = %kind, error = %e, "Write failed, trying next tier");
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_fallback(kind.as_str());
                    tried.push((kind, e.to_string()));
                }
            }
        }

        Err(StorageError::AllBackendsFailed {
            key: key.to_string(),
            tried,
        })
    }

    /// Write to one specific tier, bypassing routing.
    #[tracing::instrument(skip(self, value))]
    pub async fn save_to(&self, kind: BackendKind, key: &str, value: &Value) -> Result<(), StorageError> {
        let backend = self.registry.get(kind).ok_or(StorageError::NotConfigured(kind))?;
        self.observe(kind, OpKind::Write, backend.set(key, value)).await?;
        if kind != BackendKind::Ephemeral {
            self.invalidate_cached(key).await;
        }
        Ok(())
    }

    /// Drop a cached copy so the next read sees the new value.
    async fn invalidate_cached(&self, key: &str) {
        if let Some(ephemeral) = self.ephemeral() {
            if let Err(e) = ephemeral.remove(key).await {
                debug!(key, error = %e, "Failed to invalidate cached copy");
            }
        }
    }

    pub async fn load(&self, key: &str) -> Option<Value> {
        self.load_with_source(key).await.map(|loaded| loaded.value)
    }

    /// First hit wins. Backend failures count as misses.
    #[tracing::instrument(skip(self))]
    pub async fn load_with_source(&self, key: &str) -> Option<Loaded> {
        if let Some(ephemeral) = self.ephemeral() {
            match self.observe(BackendKind::Ephemeral, OpKind::Read, ephemeral.get(key)).await {
                Ok(Some(value)) => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache(true);
                    return Some(Loaded {
                        value,
                        source: BackendKind::Ephemeral,
                    });
                }
                Ok(None) => {}
                Err(e) => debug!(key, error = %e, "Ephemeral read failed"),
            }
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache(false);

        let usable = self.usable_kinds().await;
        let kinds: Vec<BackendKind> = self
            .registry
            .kinds()
            .into_iter()
            .filter(|kind| *kind != BackendKind::Ephemeral && usable.contains(kind))
            .collect();

        for kind in self.health.read_order(&kinds) {
            let Some(backend) = self.registry.get(kind) else { continue };
            match self.observe(kind, OpKind::Read, backend.get(key)).await {
                Ok(Some(value)) => {
                    self.promote(key, &value).await;
                    return Some(Loaded { value, source: kind });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key, backend = %kind, error = %e, "Read failed, trying next tier");
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_fallback(kind.as_str());
                }
            }
        }
        None
    }

    /// Read from one specific tier. Unlike [`load`](Self::load), failures
    /// are returned rather than treated as misses.
    #[tracing::instrument(skip(self))]
    pub async fn load_from(&self, kind: BackendKind, key: &str) -> Result<Option<Value>, StorageError> {
        let backend = self.registry.get(kind).ok_or(StorageError::NotConfigured(kind))?;
        if !self.health.is_healthy(kind) || !backend.is_available().await {
            return Err(StorageError::TransientIo {
                backend: kind,
                message: "backend unavailable or unhealthy".to_string(),
            });
        }
        self.observe(kind, OpKind::Read, backend.get(key)).await
    }

    async fn promote(&self, key: &str, value: &Value) {
        let Some(ephemeral) = self.ephemeral() else { return };
        match ephemeral.set(key, value).await {
            Ok(()) => {
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_promotion(true);
            }
            Err(e) => {
                warn!(key, error = %e, "Promotion into ephemeral tier failed");
                crate::metrics::record_promotion(false);
            }
        }
    }

    /// Remove `key` from every registered tier concurrently.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> DeleteReport {
        let removals = self
            .registry
            .iter()
            .map(|(kind, backend)| async move { (kind, self.observe(kind, OpKind::Delete, backend.remove(key)).await) });

        let mut report = DeleteReport::default();
        for (kind, result) in join_all(removals).await {
            match result {
                Ok(()) => report.removed_from.push(kind),
                Err(e) => {
                    warn!(key, backend = %kind, error = %e, "Delete failed");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        report
    }

    /// Union of keys across tiers, sorted. Tiers that fail to list are skipped.
    pub async fn list(&self) -> Vec<String> {
        let listings = self
            .registry
            .iter()
            .map(|(kind, backend)| async move { (kind, backend.list().await) });

        let mut keys = BTreeSet::new();
        for (kind, result) in join_all(listings).await {
            match result {
                Ok(found) => keys.extend(found),
                Err(e) => warn!(backend = %kind, error = %e, "List failed"),
            }
        }
        keys.into_iter().collect()
    }

    pub async fn storage_quotas(&self) -> QuotaReport {
        let reads = self
            .registry
            .iter()
            .map(|(kind, backend)| async move { (kind, backend.quota().await) });

        let mut report = QuotaReport::default();
        for (kind, result) in join_all(reads).await {
            report.tiers.push(match result {
                Ok(quota) => {
                    self.note_quota(kind, &quota);
                    TierQuota {
                        backend: kind,
                        quota: Some(quota),
                        error: None,
                    }
                }
                Err(e) => TierQuota {
                    backend: kind,
                    quota: None,
                    error: Some(e.to_string()),
                },
            });
        }
        report
    }

    fn note_quota(&self, kind: BackendKind, quota: &crate::storage::traits::StorageQuota) {
        crate::metrics::set_quota_usage(kind.as_str(), quota.usage_ratio());
        if quota.is_warning() {
            warn!(
                backend = %kind,
                used = quota.used,
                max = quota.max_size,
                "Tier above quota warning threshold"
            );
            crate::metrics::record_quota_warning(kind.as_str());
        }
    }

    /// Ask every tier to drop stale entries.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> CleanupReport {
        let runs = self
            .registry
            .iter()
            .map(|(kind, backend)| async move { (kind, backend.cleanup().await) });

        let mut report = CleanupReport::default();
        for (kind, result) in join_all(runs).await {
            match result {
                Ok(n) => report.reclaimed.push((kind, n)),
                Err(e) => {
                    warn!(backend = %kind, error = %e, "Cleanup failed");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        info!(reclaimed = report.total(), "Storage cleanup finished");
        report
    }

    #[must_use]
    pub fn metrics(&self) -> StorageMetrics {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn health_status(&self) -> Vec<StorageHealth> {
        self.health.snapshots()
    }

    #[must_use]
    pub fn circuit_states(&self) -> Vec<(BackendKind, CircuitBreakerState)> {
        self.registry.circuits().snapshots()
    }

    /// Probe every tier once: availability plus a timed quota read.
    pub async fn run_health_check(&self) -> Vec<StorageHealth> {
        let probes = self.registry.iter().map(|(kind, backend)| async move {
            let started = Instant::now();
            let available = backend.is_available().await;
            let quota = if available { Some(backend.quota().await) } else { None };
            (kind, available, quota, started.elapsed())
        });

        for (kind, available, quota, latency) in join_all(probes).await {
            let probe_ok = match &quota {
                Some(Ok(q)) => {
                    self.note_quota(kind, q);
                    true
                }
                Some(Err(e)) => {
                    debug!(backend = %kind, error = %e, "Health probe failed");
                    false
                }
                None => false,
            };
            self.health.record_probe(kind, available, probe_ok, latency, self.now());
            crate::metrics::record_probe_latency(kind.as_str(), latency);
            crate::metrics::set_backend_healthy(kind.as_str(), self.health.is_healthy(kind));
        }
        self.health.snapshots()
    }

    /// Spawn the health probe loop and the ephemeral sweeper.
    ///
    /// Both tasks hold only weak references and stop on their own when the
    /// router is dropped; [`shutdown`](Self::shutdown) stops them at once.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.health_config.check_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(router) = weak.upgrade() else { break };
                router.run_health_check().await;
            }
        }));

        if let Some(ephemeral) = self.registry.ephemeral_store() {
            tasks.push(ephemeral.spawn_sweeper(self.sweep_interval));
        }
        info!(tiers = ?self.registry.kinds(), ?interval, "Storage router started");
    }

    /// Stop background tasks, clear health and counters, release pools.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        self.health.clear();
        self.counters.reset();
        self.registry.close().await;
        info!("Storage router shut down");
    }
}
