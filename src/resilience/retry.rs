// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Retries happen at the call level, against the same backend, and only for
//! error kinds on the policy's allow-list (by default just transient I/O).
//! Switching to a different backend is the router's job, not this module's.
//!
//! # Example
//!
//! ```
//! use batch_vault::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::query();
//! assert_eq!(policy.max_retries, 3);
//!
//! // Backoff doubles per attempt until it hits the cap
//! assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
//! assert_eq!(policy.backoff_delay(10), policy.max_backoff_delay);
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::storage::traits::{ErrorKind, StorageError};

/// Immutable retry configuration.
///
/// `max_retries` is the total number of attempts, so `3` means one initial
/// call plus two retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_backoff_delay_ms")]
    pub max_backoff_delay: Duration,
    pub jitter_enabled: bool,
    /// Maximum relative deviation applied when jitter is enabled (0.1 = ±10%).
    pub jitter_factor: f64,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryPolicy {
    /// Fast-fail retry for opening local stores at startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_backoff_delay: Duration::from_secs(2),
            jitter_enabled: false,
            jitter_factor: 0.0,
            retryable_kinds: vec![ErrorKind::TransientIo],
        }
    }

    /// Quick retry for individual remote calls.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_backoff_delay: Duration::from_secs(2),
            jitter_enabled: true,
            jitter_factor: 0.1,
            retryable_kinds: vec![ErrorKind::TransientIo],
        }
    }

    /// Minimal delays, no jitter.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_backoff_delay: Duration::from_millis(10),
            jitter_enabled: false,
            jitter_factor: 0.0,
            retryable_kinds: vec![ErrorKind::TransientIo],
        }
    }

    #[must_use]
    pub fn is_retryable(&self, err: &StorageError) -> bool {
        // A rejected call must end the attempt cycle, never feed another loop.
        if matches!(err, StorageError::CircuitOpen { .. }) {
            return false;
        }
        self.retryable_kinds.contains(&err.kind())
    }

    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(base_delay * 2^(attempt-1), max_backoff_delay)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_backoff_delay)
            .min(self.max_backoff_delay)
    }

    /// Delay actually slept before the next attempt, jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter_enabled || self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = self.jitter_factor.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay.mul_f64((1.0 + offset).max(0.0))
    }
}

/// Call-level retry executor.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the policy's attempt budget is spent.
    ///
    /// `context` is free-form text (usually the key) included in logs.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation_id: &str,
        context: &str,
        mut operation: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = operation_id, context, attempt, "Operation succeeded after retry");
                        crate::metrics::record_retry(operation_id, "recovered");
                    }
                    return Ok(value);
                }
                Err(err) if !self.policy.is_retryable(&err) => {
                    debug!(operation = operation_id, context, error = %err, "Non-retryable failure");
                    return Err(err);
                }
                Err(err) if attempt >= max_attempts => {
                    warn!(
                        operation = operation_id,
                        context,
                        attempts = attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    crate::metrics::record_retry(operation_id, "exhausted");
                    return Err(StorageError::RetriesExhausted {
                        operation: operation_id.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_id,
                        context,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Operation failed, retrying in {:?}",
                        delay
                    );
                    crate::metrics::record_retry(operation_id, "retry");
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::BackendKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn transient() -> StorageError {
        StorageError::TransientIo {
            backend: BackendKind::RemoteServer,
            message: "connection reset".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let manager = RetryManager::new(RetryPolicy::immediate(3));
        let result = manager
            .execute_with_retry("test_op", "k", || async { Ok::<_, StorageError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(RetryPolicy::immediate(3));

        let result = manager
            .execute_with_retry("test_op", "k", || {
                let a = attempts.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(RetryPolicy::immediate(3));

        let result: Result<(), _> = manager
            .execute_with_retry("test_op", "k", || {
                let a = attempts.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(StorageError::RetriesExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, StorageError::TransientIo { .. }));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(RetryPolicy::immediate(5));

        let result: Result<(), _> = manager
            .execute_with_retry("test_op", "k", || {
                let a = attempts.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::CapacityExceeded {
                        backend: BackendKind::FastLocal,
                        requested: 10,
                        limit: 1,
                    })
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(StorageError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn test_circuit_open_is_terminal() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut policy = RetryPolicy::immediate(5);
        // Even if someone allow-lists it, a rejection must not loop.
        policy.retryable_kinds.push(ErrorKind::CircuitOpen);
        let manager = RetryManager::new(policy);

        let result: Result<(), _> = manager
            .execute_with_retry("test_op", "k", || {
                let a = attempts.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::CircuitOpen {
                        circuit: "remote-server".into(),
                        retry_after: Duration::from_secs(5),
                    })
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(StorageError::CircuitOpen { .. })));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_backoff_delay: Duration::from_millis(500),
            jitter_enabled: false,
            jitter_factor: 0.0,
            retryable_kinds: vec![ErrorKind::TransientIo],
        };

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = RetryPolicy::query();
        let mut previous = Duration::ZERO;
        for attempt in 1..20 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_enabled: true,
            jitter_factor: 0.25,
            ..RetryPolicy::query()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(150));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_policy_presets() {
        assert_eq!(RetryPolicy::startup().max_retries, 5);
        assert_eq!(RetryPolicy::query().max_retries, 3);
        assert!(!RetryPolicy::immediate(2).jitter_enabled);
    }
}
