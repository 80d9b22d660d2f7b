// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-injecting wrapper around any backend.
//!
//! Fails on chosen call numbers, permanently after N calls, or while a
//! switch is on. Can also report unavailability and add latency. Used by
//! the chaos and router tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{BackendKind, StorageBackend, StorageError, StorageQuota};

/// Which error an injected failure produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Transient,
    Backend,
    Capacity,
}

pub struct FlakyStore<S> {
    inner: S,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call numbered above this (0 = disabled)
    fail_after: AtomicU64,
    failing: AtomicBool,
    available: AtomicBool,
    mode: FailureMode,
    latency: Mutex<Duration>,
    message: String,
}

impl<S: StorageBackend> FlakyStore<S> {
    pub fn new(inner: S, mode: FailureMode) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls: Vec::new(),
            fail_after: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            available: AtomicBool::new(true),
            mode,
            latency: Mutex::new(Duration::ZERO),
            message: "injected failure".to_string(),
        }
    }

    /// Fail exactly on these (1-indexed) call numbers.
    #[must_use]
    pub fn failing_on(mut self, calls: Vec<u64>) -> Self {
        self.fail_on_calls = calls;
        self
    }

    /// Fail every call after the first `n`.
    #[must_use]
    pub fn failing_after(self, n: u64) -> Self {
        self.fail_after.store(n, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Fail every call while on.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let after = self.fail_after.load(Ordering::SeqCst);
        self.failing.load(Ordering::SeqCst) || (after > 0 && count > after) || self.fail_on_calls.contains(&count)
    }

    async fn maybe_fail(&self) -> Result<(), StorageError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.should_fail() {
            return Ok(());
        }
        let backend = self.inner.kind();
        Err(match self.mode {
            FailureMode::Transient => StorageError::TransientIo {
                backend,
                message: self.message.clone(),
            },
            FailureMode::Backend => StorageError::Backend(self.message.clone()),
            FailureMode::Capacity => StorageError::CapacityExceeded {
                backend,
                requested: 0,
                limit: 0,
            },
        })
    }
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for FlakyStore<S> {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.inner.is_available().await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.maybe_fail().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.maybe_fail().await?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail().await?;
        self.inner.remove(key).await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.maybe_fail().await?;
        self.inner.list().await
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        // Probes see latency but not injected failures
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.inner.quota().await
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        self.maybe_fail().await?;
        self.inner.cleanup().await
    }
}
