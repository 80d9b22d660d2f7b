// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types returned by the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::storage::traits::{BackendKind, StorageQuota};

/// Per-write routing hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Matched against rules that restrict themselves to one data type
    pub data_type: Option<String>,
    /// Tried before anything the rules pick, if healthy
    pub preferred: Option<BackendKind>,
}

impl SaveOptions {
    #[must_use]
    pub fn data_type(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
            preferred: None,
        }
    }

    #[must_use]
    pub fn preferred(kind: BackendKind) -> Self {
        Self {
            data_type: None,
            preferred: Some(kind),
        }
    }
}

/// A value read through the router, with the tier that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub value: serde_json::Value,
    pub source: BackendKind,
}

/// Outcome of removing a key from every tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub removed_from: Vec<BackendKind>,
    pub failed: Vec<(BackendKind, String)>,
}

impl DeleteReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierQuota {
    pub backend: BackendKind,
    pub quota: Option<StorageQuota>,
    pub error: Option<String>,
}

/// Capacity of every registered tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaReport {
    pub tiers: Vec<TierQuota>,
}

impl QuotaReport {
    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Option<&StorageQuota> {
        self.tiers
            .iter()
            .find(|t| t.backend == kind)
            .and_then(|t| t.quota.as_ref())
    }

    /// Tiers at or above their warning threshold.
    #[must_use]
    pub fn warnings(&self) -> Vec<BackendKind> {
        self.tiers
            .iter()
            .filter(|t| t.quota.is_some_and(|q| q.is_warning()))
            .map(|t| t.backend)
            .collect()
    }

    #[must_use]
    pub fn total_used(&self) -> u64 {
        self.tiers.iter().filter_map(|t| t.quota).map(|q| q.used).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub reclaimed: Vec<(BackendKind, usize)>,
    pub failed: Vec<(BackendKind, String)>,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.reclaimed.iter().map(|(_, n)| n).sum()
    }
}

/// Router operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Delete,
}

impl OpKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

/// Snapshot of one operation category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OpSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(with = "crate::config::duration_ms")]
    pub avg_latency: Duration,
}

/// Read-only view of router activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StorageMetrics {
    pub reads: OpSnapshot,
    pub writes: OpSnapshot,
    pub deletes: OpSnapshot,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Writes or reads that moved on to another tier after a failure
    pub fallbacks: u64,
    pub promotions: u64,
}

impl StorageMetrics {
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
pub(super) struct OpCounter {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
}

impl OpCounter {
    pub(super) fn record(&self, success: bool, latency: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OpSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);
        OpSnapshot {
            attempts,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_latency: if attempts == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total / attempts)
            },
        }
    }

    fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Counters owned by the router.
#[derive(Debug, Default)]
pub(super) struct RouterCounters {
    pub(super) reads: OpCounter,
    pub(super) writes: OpCounter,
    pub(super) deletes: OpCounter,
    pub(super) cache_hits: AtomicU64,
    pub(super) cache_misses: AtomicU64,
    pub(super) fallbacks: AtomicU64,
    pub(super) promotions: AtomicU64,
}

impl RouterCounters {
    pub(super) fn op(&self, kind: OpKind) -> &OpCounter {
        match kind {
            OpKind::Read => &self.reads,
            OpKind::Write => &self.writes,
            OpKind::Delete => &self.deletes,
        }
    }

    pub(super) fn snapshot(&self) -> StorageMetrics {
        StorageMetrics {
            reads: self.reads.snapshot(),
            writes: self.writes.snapshot(),
            deletes: self.deletes.snapshot(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }

    pub(super) fn reset(&self) {
        self.reads.reset();
        self.writes.reset();
        self.deletes.reset();
        for counter in [&self.cache_hits, &self.cache_misses, &self.fallbacks, &self.promotions] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
