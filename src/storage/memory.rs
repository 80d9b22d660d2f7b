// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unbounded in-memory backend that can impersonate any tier.
//!
//! Used to stand in for real tiers in tests and for embedding the router
//! where persistence is not wanted. Capacity and availability are settable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{payload_size, BackendKind, StorageBackend, StorageError, StorageQuota};

pub struct MemoryStore {
    kind: BackendKind,
    data: DashMap<String, Value>,
    available: AtomicBool,
    max_size: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            data: DashMap::new(),
            available: AtomicBool::new(true),
            max_size: AtomicU64::new(u64::MAX),
        }
    }

    #[must_use]
    pub fn with_capacity_bytes(self, max_size: u64) -> Self {
        self.max_size.store(max_size, Ordering::Relaxed);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn used(&self) -> u64 {
        self.data
            .iter()
            .map(|entry| payload_size(entry.value()).unwrap_or(0))
            .sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let size = payload_size(value)?;
        let limit = self.max_size.load(Ordering::Relaxed);
        let replaced = self.data.get(key).map(|r| payload_size(r.value()).unwrap_or(0)).unwrap_or(0);
        if self.used().saturating_sub(replaced).saturating_add(size) > limit {
            return Err(StorageError::CapacityExceeded {
                backend: self.kind,
                requested: size,
                limit,
            });
        }
        self.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.iter().map(|r| r.key().clone()).collect())
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        Ok(StorageQuota {
            max_size: self.max_size.load(Ordering::Relaxed),
            warning_threshold: 0.8,
            used: self.used(),
        })
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new(BackendKind::BulkLocal);
        store.set("item-1", &json!({"v": 1})).await.unwrap();
        assert_eq!(store.get("item-1").await.unwrap(), Some(json!({"v": 1})));
        assert!(store.get("nonexistent").await.unwrap().is_none());
        assert_eq!(store.kind(), BackendKind::BulkLocal);
    }

    #[tokio::test]
    async fn test_remove_nonexistent_is_ok() {
        let store = MemoryStore::new(BackendKind::FastLocal);
        assert!(store.remove("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let store = MemoryStore::new(BackendKind::FastLocal).with_capacity_bytes(10);
        store.set("a", &json!("1234")).await.unwrap();
        let err = store.set("b", &json!("12345678")).await.unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { .. }));
        // Overwrite within budget
        store.set("a", &json!("123456")).await.unwrap();
    }

    #[tokio::test]
    async fn test_availability_toggle() {
        let store = MemoryStore::new(BackendKind::RemoteServer);
        assert!(store.is_available().await);
        store.set_available(false);
        assert!(!store.is_available().await);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let store = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store_clone
                        .set(&format!("batch-{batch}-item-{i}"), &json!(i))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
        store.clear();
        assert!(store.is_empty());
    }
}
