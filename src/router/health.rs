// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rolling health table.
//!
//! Two independent writers: the probe loop owns [`ProbeStats`], real
//! operations own [`OpStats`]. Neither touches the other's fields. They are
//! combined into a [`StorageHealth`] only when someone reads it.
//!
//! Reconciliation: the operation error rate is an EWMA over outcomes. A
//! backend pushed above the ceiling stops receiving traffic, so its rate
//! would never move again. Each successful probe recorded after the last
//! real operation therefore decays the reported rate by one EWMA step, as
//! if it were a successful operation.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::storage::traits::BackendKind;

const PROBE_HISTORY: usize = 16;

/// Health of one tier as seen by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageHealth {
    pub backend: BackendKind,
    pub available: bool,
    pub responsive: bool,
    /// Rolling average probe latency
    #[serde(with = "crate::config::duration_ms")]
    pub latency: Duration,
    pub error_rate: f64,
    /// Epoch millis of the last probe, `None` before the first one
    pub last_check: Option<i64>,
}

impl StorageHealth {
    /// Usable for reads and writes.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.available && self.responsive
    }
}

#[derive(Debug, Clone, Default)]
struct ProbeStats {
    available: bool,
    probe_ok: bool,
    latency_ms: Option<f64>,
    last_check: Option<i64>,
    /// Times of recent successful probes, newest last
    ok_at: VecDeque<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct OpStats {
    error_rate: f64,
    last_op_at: i64,
}

pub struct HealthTable {
    config: HealthConfig,
    probes: DashMap<BackendKind, ProbeStats>,
    ops: DashMap<BackendKind, OpStats>,
}

impl HealthTable {
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            probes: DashMap::new(),
            ops: DashMap::new(),
        }
    }

    /// Start tracking a backend. Backends are presumed healthy until probed.
    pub fn register(&self, kind: BackendKind) {
        self.probes.entry(kind).or_insert_with(|| ProbeStats {
            available: true,
            probe_ok: true,
            ..Default::default()
        });
        self.ops.entry(kind).or_default();
    }

    /// Probe loop only.
    pub fn record_probe(&self, kind: BackendKind, available: bool, probe_ok: bool, latency: Duration, now: i64) {
        let alpha = self.config.latency_alpha;
        let sample = latency.as_secs_f64() * 1000.0;
        let threshold_ms = self.config.responsive_threshold().as_secs_f64() * 1000.0;

        let mut stats = self.probes.entry(kind).or_default();
        stats.available = available;
        stats.probe_ok = probe_ok && sample < threshold_ms;
        stats.latency_ms = Some(match stats.latency_ms {
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
            None => sample,
        });
        stats.last_check = Some(now);
        if available && stats.probe_ok {
            stats.ok_at.push_back(now);
            while stats.ok_at.len() > PROBE_HISTORY {
                stats.ok_at.pop_front();
            }
        } else {
            stats.ok_at.clear();
        }
    }

    /// Real operations only. Callers pass only outcomes that say something
    /// about the backend (see `StorageError::is_health_affecting`).
    pub fn record_outcome(&self, kind: BackendKind, success: bool, now: i64) {
        let alpha = self.config.error_rate_alpha;
        let sample = if success { 0.0 } else { 1.0 };
        let mut stats = self.ops.entry(kind).or_default();
        stats.error_rate = alpha * sample + (1.0 - alpha) * stats.error_rate;
        stats.last_op_at = now;
    }

    #[must_use]
    pub fn snapshot(&self, kind: BackendKind) -> Option<StorageHealth> {
        let probe = self.probes.get(&kind)?.clone();
        let ops = self.ops.get(&kind).map(|r| *r).unwrap_or_default();

        let decay_steps = probe.ok_at.iter().filter(|at| **at > ops.last_op_at).count() as i32;
        let error_rate = ops.error_rate * (1.0 - self.config.error_rate_alpha).powi(decay_steps);
        let responsive = probe.probe_ok && error_rate < self.config.error_rate_ceiling;

        Some(StorageHealth {
            backend: kind,
            available: probe.available,
            responsive,
            latency: Duration::from_secs_f64(probe.latency_ms.unwrap_or(0.0) / 1000.0),
            error_rate,
            last_check: probe.last_check,
        })
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<StorageHealth> {
        let mut kinds: Vec<BackendKind> = self.probes.iter().map(|r| *r.key()).collect();
        kinds.sort();
        kinds.into_iter().filter_map(|kind| self.snapshot(kind)).collect()
    }

    #[must_use]
    pub fn is_healthy(&self, kind: BackendKind) -> bool {
        self.snapshot(kind).is_some_and(|h| h.is_healthy())
    }

    /// Healthy backends among `kinds`, fastest measured first. Nominal tier
    /// order breaks ties.
    #[must_use]
    pub fn read_order(&self, kinds: &[BackendKind]) -> Vec<BackendKind> {
        let mut healthy: Vec<(BackendKind, Duration)> = kinds
            .iter()
            .filter_map(|kind| self.snapshot(*kind))
            .filter(StorageHealth::is_healthy)
            .map(|h| (h.backend, h.latency))
            .collect();
        healthy.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        healthy.into_iter().map(|(kind, _)| kind).collect()
    }

    pub fn clear(&self) {
        self.probes.clear();
        self.ops.clear();
    }
}
