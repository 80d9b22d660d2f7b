// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process tier: bounded LRU with per-entry TTL.
//!
//! Always available. Inserting at capacity evicts the least recently
//! accessed entry. Expired entries are dropped lazily on access and
//! eagerly by the sweep task.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::traits::{payload_size, BackendKind, StorageBackend, StorageError, StorageQuota};
use crate::config::EphemeralConfig;
use crate::platform::Platform;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    size: u64,
    expires_at: i64,
}

pub struct EphemeralStore {
    entries: Mutex<LruCache<String, Entry>>,
    default_ttl: Duration,
    max_size_bytes: u64,
    platform: Arc<dyn Platform>,
}

impl EphemeralStore {
    #[must_use]
    pub fn new(config: &EphemeralConfig, platform: Arc<dyn Platform>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            max_size_bytes: config.max_size_bytes,
            platform,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        crate::metrics::set_ephemeral_items(0);
    }

    /// Insert with an explicit time-to-live.
    pub fn set_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StorageError> {
        let size = payload_size(value)?;
        let expires_at = self.platform.now_millis().saturating_add(ttl.as_millis() as i64);
        let mut entries = self.entries.lock();
        let evicted = entries.push(
            key.to_string(),
            Entry {
                value: value.clone(),
                size,
                expires_at,
            },
        );
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                trace!(key = %evicted_key, "Ephemeral entry evicted (LRU)");
            }
        }
        crate::metrics::set_ephemeral_items(entries.len());
        Ok(())
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.platform.now_millis();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        crate::metrics::set_ephemeral_items(entries.len());
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired ephemeral entries");
            crate::metrics::record_reclaimed(BackendKind::Ephemeral.as_str(), expired.len());
        }
        expired.len()
    }

    /// Periodic sweep. The task ends on its own once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                store.sweep_expired();
            }
        })
    }
}

#[async_trait]
impl StorageBackend for EphemeralStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Ephemeral
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let now = self.platform.now_millis();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.set_with_ttl(key, value, self.default_ttl)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().pop(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let now = self.platform.now_millis();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        let used = self.entries.lock().iter().map(|(_, entry)| entry.size).sum();
        Ok(StorageQuota {
            max_size: self.max_size_bytes,
            warning_threshold: 0.9,
            used,
        })
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        Ok(self.sweep_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualPlatform;
    use serde_json::json;

    fn store(max_entries: usize, ttl_ms: u64) -> (EphemeralStore, Arc<ManualPlatform>) {
        let platform = Arc::new(ManualPlatform::new(1_000));
        let config = EphemeralConfig {
            max_entries,
            default_ttl_ms: ttl_ms,
            ..Default::default()
        };
        (EphemeralStore::new(&config, platform.clone()), platform)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _) = store(10, 60_000);
        store.set("k", &json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let (store, _) = store(2, 60_000);
        store.set("a", &json!(1)).await.unwrap();
        store.set("b", &json!(2)).await.unwrap();
        // Touch "a" so "b" becomes least recently used
        store.get("a").await.unwrap();
        store.set("c", &json!(3)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_read() {
        let (store, clock) = store(10, 500);
        store.set("k", &json!("v")).await.unwrap();

        clock.advance_millis(499);
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance_millis(1);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (store, clock) = store(10, 1_000);
        store.set("short", &json!(1)).await.unwrap();
        store.set_with_ttl("long", &json!(2), Duration::from_secs(60)).unwrap();

        clock.advance_millis(2_000);
        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert_eq!(store.list().await.unwrap(), vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn test_quota_tracks_payload_sizes() {
        let (store, _) = store(10, 60_000);
        store.set("k", &json!({"a": 1})).await.unwrap();
        let quota = store.quota().await.unwrap();
        assert_eq!(quota.used, 7);
        assert!(store.is_available().await);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let platform = Arc::new(ManualPlatform::new(0));
        let config = EphemeralConfig {
            default_ttl_ms: 10,
            ..Default::default()
        };
        let store = Arc::new(EphemeralStore::new(&config, platform.clone()));
        store.set("k", &json!(1)).await.unwrap();
        platform.advance_millis(100);

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
