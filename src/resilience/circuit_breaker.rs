// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding remote storage tiers.
//!
//! Protects the router from hammering a remote backend that keeps failing.
//! Wraps async operations, counts health-affecting failures inside a sliding
//! monitoring window and "trips" once the threshold is reached.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Backend unhealthy, requests fail fast without being attempted
//! - HalfOpen: Cool-down elapsed, a single probe request is let through

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::storage::traits::{BackendKind, StorageError};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures inside the monitoring window that trip the circuit
    pub failure_threshold: u32,
    /// How long to stay open before letting a probe through
    #[serde(with = "duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
    /// Failures older than this no longer count toward the threshold
    #[serde(with = "duration_ms", rename = "monitoring_window_ms")]
    pub monitoring_window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Trips faster, waits longer before probing
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures, probes sooner
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(15),
            monitoring_window: Duration::from_secs(60),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            monitoring_window: Duration::from_secs(10),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub is_open: bool,
    pub failure_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rejected_requests: u64,
    /// Epoch millis at which an open circuit will admit a probe.
    pub next_attempt_time: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    next_attempt: Option<SystemTime>,
    probe_started: Option<Instant>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            next_attempt: None,
            probe_started: None,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn cool_down_elapsed(&self, reset_timeout: Duration, now: Instant) -> bool {
        self.opened_at
            .map(|opened| now.duration_since(opened) >= reset_timeout)
            .unwrap_or(true)
    }

    fn retry_after(&self, reset_timeout: Duration, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| reset_timeout.saturating_sub(now.duration_since(opened)))
            .unwrap_or_default()
    }
}

enum Admission {
    Pass,
    Probe,
    Reject(Duration),
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    // Metrics
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::closed()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state without side effects. An open circuit whose cool-down
    /// has elapsed is reported as `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if inner.cool_down_elapsed(self.config.reset_timeout, Instant::now()) => {
                CircuitState::HalfOpen
            }
            other => other,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let state = self.state();
        let inner = self.inner.lock();
        let failure_count = inner
            .failures
            .iter()
            .filter(|at| at.elapsed() <= self.config.monitoring_window)
            .count() as u32;
        let next_attempt_time = match state {
            CircuitState::Open => inner
                .next_attempt
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64),
            _ => None,
        };

        CircuitBreakerState {
            name: self.name.clone(),
            state,
            is_open: state == CircuitState::Open,
            failure_count,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            next_attempt_time,
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                if inner.cool_down_elapsed(self.config.reset_timeout, now) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(now);
                    info!(circuit = %self.name, "Circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Reject(inner.retry_after(self.config.reset_timeout, now))
                }
            }
            CircuitState::HalfOpen => {
                // One probe at a time; a probe that never reported back is
                // superseded after another cool-down.
                let stale = inner
                    .probe_started
                    .map(|started| now.duration_since(started) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(now);
                    Admission::Probe
                } else {
                    Admission::Reject(self.config.reset_timeout)
                }
            }
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.next_attempt = Some(SystemTime::now() + self.config.reset_timeout);
        inner.probe_started = None;
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
    }

    fn on_healthy(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe || inner.state == CircuitState::HalfOpen {
            info!(circuit = %self.name, "Probe succeeded, circuit closed");
            *inner = Inner::closed();
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
        } else {
            inner.failures.clear();
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures.push_back(now);
        inner.prune(self.config.monitoring_window, now);

        if probe || inner.state == CircuitState::HalfOpen {
            warn!(circuit = %self.name, "Probe failed, circuit re-opened");
            self.trip(&mut inner, now);
            return;
        }

        let failures = inner.failures.len() as u32;
        if inner.state == CircuitState::Closed && failures >= self.config.failure_threshold {
            warn!(
                circuit = %self.name,
                failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker tripped"
            );
            self.trip(&mut inner, now);
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// While open, fails with [`StorageError::CircuitOpen`] without calling
    /// `operation`. Only health-affecting errors count as failures; any other
    /// outcome tells the breaker the backend answered.
    pub async fn execute<F, Fut, T>(&self, operation_id: &str, operation: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let probe = match self.admit() {
            Admission::Pass => false,
            Admission::Probe => true,
            Admission::Reject(retry_after) => {
                self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, operation = operation_id, "Circuit open, call rejected");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                return Err(StorageError::CircuitOpen {
                    circuit: self.name.clone(),
                    retry_after,
                });
            }
        };

        match operation().await {
            Ok(value) => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
                self.on_healthy(probe);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(value)
            }
            Err(err) if err.is_health_affecting() => {
                debug!(circuit = %self.name, operation = operation_id, error = %err, "Circuit call failed");
                self.on_failure(probe);
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(err)
            }
            Err(err) => {
                self.on_healthy(probe);
                crate::metrics::record_circuit_breaker_call(&self.name, "caller_error");
                Err(err)
            }
        }
    }

    /// Clear all counters and force the circuit closed.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::closed();
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.rejected_requests.store(0, Ordering::Relaxed);
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
        info!(circuit = %self.name, "Circuit breaker reset");
    }
}

/// One breaker per remote backend kind, created on first use.
#[derive(Debug, Default)]
pub struct BackendCircuits {
    config: CircuitConfig,
    circuits: DashMap<BackendKind, Arc<CircuitBreaker>>,
}

impl BackendCircuits {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn get(&self, kind: BackendKind) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(kind)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(kind.as_str(), self.config.clone())))
            .clone()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<(BackendKind, CircuitBreakerState)> {
        let mut out: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect();
        out.sort_by_key(|(kind, _)| *kind);
        out
    }

    pub fn reset_all(&self) {
        for entry in self.circuits.iter() {
            entry.value().reset();
        }
    }
}
