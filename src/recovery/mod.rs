// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery orchestrator.
//!
//! Rebuilds a batch's state from whichever durable tiers still hold it.
//!
//! # Per-recovery flow
//!
//! ```text
//! for source in [preferred?, fast-local, bulk-local, remote-server]:
//!     cancelled?            → Cancelled
//!     past deadline?        → Timeout
//!     read + open record    (failure → failed_items, next source)
//!     conflicts with accumulator?
//!         manual            → Conflict
//!         auto              → field rules, warning per decision
//!     complete?             → Success
//! sources exhausted         → Partial (if allowed and something found) | Failed
//! ```
//!
//! Sources are queried strictly one after another. Concurrent calls for the
//! same batch share one run. Cancellation and the deadline are checked
//! between sources; an in-flight backend call is allowed to finish and its
//! result is discarded.

mod conflict;
mod progressive;
mod types;

pub use conflict::{auto_resolve, detect_conflicts, resolution_options, FieldResolution, Winner};
pub use types::{
    ComponentRecovery, ComponentStatus, ConflictInfo, ConflictResolution, ProgressiveRecoveryResult, RecoveryMetadata,
    RecoveryOptions, RecoveryResult, RecoveryStats, RecoveryStatus, ResolutionOption,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch_state::{state_key, BatchState, PartialBatchState, PersistedRecord};
use crate::config::RecoveryConfig;
use crate::router::UnifiedStorage;
use crate::storage::traits::{BackendKind, StorageError};

struct InFlight {
    attempt: u64,
    cancel: Arc<AtomicBool>,
    result: Shared<BoxFuture<'static, RecoveryResult>>,
}

pub struct RecoveryOrchestrator {
    storage: Arc<UnifiedStorage>,
    config: RecoveryConfig,
    in_flight: DashMap<String, InFlight>,
    runs: AtomicU64,
    stats: Mutex<RecoveryStats>,
}

/// Everything a single run has gathered so far.
struct Accumulator {
    state: PartialBatchState,
    /// Latest timestamp among contributing records
    timestamp: i64,
    source: Option<BackendKind>,
    sources_tried: Vec<BackendKind>,
    recovered: Vec<BackendKind>,
    failed: Vec<BackendKind>,
    warnings: Vec<String>,
    contributions: Vec<(BackendKind, PartialBatchState)>,
    conflict: Option<ConflictInfo>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            state: PartialBatchState::default(),
            timestamp: 0,
            source: None,
            sources_tried: Vec::new(),
            recovered: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            contributions: Vec::new(),
            conflict: None,
        }
    }

    fn fail(&mut self, kind: BackendKind, reason: impl std::fmt::Display) {
        warn!(source = %kind, reason = %reason, "Recovery source failed");
        self.failed.push(kind);
        self.warnings.push(format!("{kind}: {reason}"));
    }
}

impl RecoveryOrchestrator {
    #[must_use]
    pub fn new(storage: Arc<UnifiedStorage>, config: RecoveryConfig) -> Self {
        Self {
            storage,
            config,
            in_flight: DashMap::new(),
            runs: AtomicU64::new(0),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<UnifiedStorage> {
        &self.storage
    }

    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Source order for one recovery: the preferred source first, then the
    /// configured order, restricted to registered tiers.
    pub(crate) fn source_order(&self, preferred: Option<BackendKind>) -> Vec<BackendKind> {
        let mut order = self.config.source_order.clone();
        if let Some(kind) = preferred {
            order.retain(|k| *k != kind);
            order.insert(0, kind);
        }
        let registry = self.storage.registry();
        order.retain(|kind| registry.contains(*kind));
        order
    }

    /// Recover a batch's state. Never fails; the outcome is in the result's
    /// status.
    ///
    /// A call made while a recovery of the same batch is running joins it
    /// and receives the same result (its own `options` are ignored).
    pub async fn recover_batch_state(self: &Arc<Self>, batch_id: &str, options: RecoveryOptions) -> RecoveryResult {
        let (attempt, result) = {
            let flight = self.in_flight.entry(batch_id.to_string()).or_insert_with(|| {
                let attempt = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
                let cancel = Arc::new(AtomicBool::new(false));
                let run = Arc::clone(self)
                    .run(batch_id.to_string(), options, cancel.clone(), attempt)
                    .boxed()
                    .shared();
                InFlight {
                    attempt,
                    cancel,
                    result: run,
                }
            });
            (flight.attempt, flight.result.clone())
        };
        crate::metrics::set_recoveries_in_flight(self.in_flight.len());

        let outcome = result.await;
        self.in_flight.remove_if(batch_id, |_, flight| flight.attempt == attempt);
        crate::metrics::set_recoveries_in_flight(self.in_flight.len());
        outcome
    }

    /// Stop a running recovery at its next source boundary. Callers waiting
    /// on it receive a `Cancelled` result. Returns whether one was running.
    pub fn cancel_recovery(&self, batch_id: &str) -> bool {
        match self.in_flight.remove(batch_id) {
            Some((_, flight)) => {
                flight.cancel.store(true, Ordering::SeqCst);
                info!(batch_id, attempt = flight.attempt, "Recovery cancelled");
                crate::metrics::set_recoveries_in_flight(self.in_flight.len());
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight and forget it.
    pub fn shutdown(&self) {
        for flight in self.in_flight.iter() {
            flight.cancel.store(true, Ordering::SeqCst);
        }
        self.in_flight.clear();
        crate::metrics::set_recoveries_in_flight(0);
        info!("Recovery orchestrator shut down");
    }

    async fn extract(&self, kind: BackendKind, key: &str) -> Result<Option<PersistedRecord<PartialBatchState>>, StorageError> {
        self.storage
            .load_from(kind, key)
            .await?
            .map(PersistedRecord::<PartialBatchState>::open)
            .transpose()
    }

    #[tracing::instrument(skip(self, options, cancel), fields(recovery_id = tracing::field::Empty))]
    async fn run(
        self: Arc<Self>,
        batch_id: String,
        options: RecoveryOptions,
        cancel: Arc<AtomicBool>,
        attempt: u64,
    ) -> RecoveryResult {
        let recovery_id = Uuid::new_v4();
        tracing::Span::current().record("recovery_id", tracing::field::display(recovery_id));

        let started = Instant::now();
        let deadline = started + options.timeout.unwrap_or(Duration::from_millis(self.config.timeout_ms));
        let key = state_key(&batch_id);
        let mut acc = Accumulator::new();

        let status = 'sources: {
            for kind in self.source_order(options.preferred_source) {
                if cancel.load(Ordering::SeqCst) {
                    break 'sources RecoveryStatus::Cancelled;
                }
                if Instant::now() >= deadline {
                    acc.warnings.push(format!("timed out before querying {kind}"));
                    break 'sources RecoveryStatus::Timeout;
                }

                acc.sources_tried.push(kind);
                let extracted = self.extract(kind, &key).await;

                // The call was allowed to finish; its result no longer counts
                if cancel.load(Ordering::SeqCst) {
                    break 'sources RecoveryStatus::Cancelled;
                }
                if Instant::now() >= deadline {
                    acc.warnings.push(format!("timed out waiting for {kind}, result discarded"));
                    break 'sources RecoveryStatus::Timeout;
                }

                let record = match extracted {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        debug!(source = %kind, "No record for batch");
                        continue;
                    }
                    Err(e) => {
                        acc.fail(kind, e);
                        continue;
                    }
                };
                if record.batch_id != batch_id {
                    acc.fail(kind, format!("record belongs to batch '{}'", record.batch_id));
                    continue;
                }
                if record.is_diverged() {
                    acc.warnings.push(format!("{kind}: checksum mismatch, record may have diverged"));
                }

                let incoming = record.state;
                if acc.state.is_empty() {
                    acc.state = incoming.clone();
                } else {
                    let conflicts = detect_conflicts(&acc.state, &incoming);
                    if conflicts.is_empty() {
                        acc.state.fill_missing_from(&incoming);
                    } else if options.conflict_resolution == ConflictResolution::Manual {
                        for field in &conflicts {
                            crate::metrics::record_conflict(field.as_str(), "manual");
                        }
                        acc.recovered.push(kind);
                        acc.conflict = Some(ConflictInfo {
                            conflict_fields: conflicts,
                            resolution_options: resolution_options(acc.timestamp, record.timestamp),
                            existing_source: acc.source.unwrap_or(kind),
                            incoming_source: kind,
                            existing: acc.state.clone(),
                            incoming,
                            existing_timestamp: acc.timestamp,
                            incoming_timestamp: record.timestamp,
                        });
                        break 'sources RecoveryStatus::Conflict;
                    } else {
                        let (merged, decisions) = auto_resolve(&acc.state, &incoming);
                        for decision in &decisions {
                            crate::metrics::record_conflict(decision.field.as_str(), "auto");
                            acc.warnings.push(format!("{kind}: {}", decision.describe()));
                        }
                        acc.state = merged;
                    }
                }

                acc.timestamp = acc.timestamp.max(record.timestamp);
                acc.source = Some(kind);
                acc.recovered.push(kind);
                acc.contributions.push((kind, incoming));

                if acc.state.is_complete() {
                    break 'sources RecoveryStatus::Success;
                }
            }

            if !acc.state.is_empty() && options.allow_partial_recovery {
                RecoveryStatus::Partial
            } else {
                RecoveryStatus::Failed
            }
        };

        let restored_state = match status {
            RecoveryStatus::Success => acc.state.clone().into_state(),
            _ => None,
        };
        if let (Some(state), true) = (&restored_state, options.write_back) {
            self.write_back(&batch_id, state, &mut acc).await;
        }

        let duration = started.elapsed();
        self.stats.lock().record(status, duration);
        crate::metrics::record_recovery(status.as_str(), duration);
        info!(
            batch_id = %batch_id,
            %status,
            source = ?acc.source,
            tried = acc.sources_tried.len(),
            warnings = acc.warnings.len(),
            "Recovery finished"
        );

        RecoveryResult {
            status,
            batch_id,
            partial_state: match status {
                RecoveryStatus::Success => None,
                _ => (!acc.state.is_empty()).then_some(acc.state),
            },
            restored_state,
            recovered_items: acc.recovered,
            failed_items: acc.failed,
            warnings: acc.warnings,
            conflict: acc.conflict,
            metadata: RecoveryMetadata {
                recovery_id,
                source: acc.source,
                sources_tried: acc.sources_tried,
                duration,
                attempt,
            },
        }
    }

    /// Rewrite the recovered state to every queried source that did not
    /// already hold exactly that state. Best effort.
    async fn write_back(&self, batch_id: &str, state: &BatchState, acc: &mut Accumulator) {
        let merged = PartialBatchState::from(state.clone());
        let stale: Vec<BackendKind> = acc
            .sources_tried
            .iter()
            .copied()
            .filter(|kind| !acc.contributions.iter().any(|(k, s)| k == kind && *s == merged))
            .collect();

        let now = self.storage.platform().now_millis();
        for kind in stale {
            let record = PersistedRecord::seal(
                state.clone(),
                batch_id,
                state.session_id.clone(),
                Some(kind.as_str().to_string()),
                now,
            )
            .and_then(|r| r.to_value());
            let written = match record {
                Ok(value) => self.storage.save_to(kind, &state_key(batch_id), &value).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => debug!(batch_id, target = %kind, "Recovered state written back"),
                Err(e) => acc.warnings.push(format!("{kind}: write-back failed: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_state::{BatchStatus, SCHEMA_VERSION};
    use crate::config::{EphemeralConfig, StorageConfig};
    use crate::platform::ManualPlatform;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::flaky::{FailureMode, FlakyStore};
    use crate::storage::memory::MemoryStore;
    use crate::storage::registry::BackendRegistry;
    use crate::storage::traits::StorageBackend;
    use serde_json::{json, Value};

    fn full(resume_count: u32, status: BatchStatus) -> BatchState {
        BatchState {
            resume_count,
            status,
            ..BatchState::new("b1", "s1", 1_000)
        }
    }

    fn record(state: &impl serde::Serialize, timestamp: i64) -> Value {
        let state = serde_json::to_value(state).unwrap();
        PersistedRecord::seal(state, "b1", "s1", None, timestamp).unwrap().to_value().unwrap()
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(
            &EphemeralConfig::default(),
            CircuitConfig::default(),
            Arc::new(ManualPlatform::new(5_000)),
        )
    }

    fn orchestrator(registry: BackendRegistry) -> Arc<RecoveryOrchestrator> {
        let storage = Arc::new(UnifiedStorage::new(registry, &StorageConfig::default()));
        Arc::new(RecoveryOrchestrator::new(storage, RecoveryConfig::default()))
    }

    #[tokio::test]
    async fn test_first_complete_source_wins_and_later_sources_untouched() {
        let fast = Arc::new(FlakyStore::new(MemoryStore::new(BackendKind::FastLocal), FailureMode::Transient));
        fast.set_failing(true);
        let bulk = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        bulk.set(&state_key("b1"), &record(&full(2, BatchStatus::Ready), 10)).await.unwrap();
        let remote = Arc::new(FlakyStore::new(MemoryStore::new(BackendKind::RemoteServer), FailureMode::Transient));

        let orch = orchestrator(registry().with_backend(fast).with_backend(bulk).with_backend(remote.clone()));
        let result = orch.recover_batch_state("b1", RecoveryOptions::default()).await;

        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.metadata.source, Some(BackendKind::BulkLocal));
        assert_eq!(result.failed_items, vec![BackendKind::FastLocal]);
        assert_eq!(result.recovered_items, vec![BackendKind::BulkLocal]);
        assert!(!result.metadata.sources_tried.contains(&BackendKind::RemoteServer));
        assert_eq!(remote.calls(), 0);
        assert_eq!(result.restored_state.unwrap().resume_count, 2);
    }

    #[tokio::test]
    async fn test_partial_sources_merge_with_auto_resolution() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        let partial = json!({"batch_id": "b1", "resume_count": 3, "status": "validating"});
        fast.set(&state_key("b1"), &record(&partial, 10)).await.unwrap();
        let remote = Arc::new(MemoryStore::new(BackendKind::RemoteServer));
        remote.set(&state_key("b1"), &record(&full(5, BatchStatus::Ready), 20)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast).with_backend(remote));
        let result = orch.recover_batch_state("b1", RecoveryOptions::default()).await;

        assert_eq!(result.status, RecoveryStatus::Success);
        let state = result.restored_state.unwrap();
        assert_eq!((state.resume_count, state.status), (5, BatchStatus::Ready));
        assert_eq!(result.metadata.source, Some(BackendKind::RemoteServer));
        assert_eq!(result.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_manual_mode_returns_conflict() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        let partial = json!({"batch_id": "b1", "resume_count": 3});
        fast.set(&state_key("b1"), &record(&partial, 10)).await.unwrap();
        let bulk = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        bulk.set(&state_key("b1"), &record(&full(5, BatchStatus::Ready), 20)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast).with_backend(bulk));
        let options = RecoveryOptions {
            conflict_resolution: ConflictResolution::Manual,
            ..Default::default()
        };
        let result = orch.recover_batch_state("b1", options).await;

        assert_eq!(result.status, RecoveryStatus::Conflict);
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.existing_source, BackendKind::FastLocal);
        assert_eq!(conflict.incoming_source, BackendKind::BulkLocal);
        assert!(conflict.conflict_fields.contains(&crate::batch_state::StateField::ResumeCount));
        let resolved = conflict.resolve(ResolutionOption::UseNewer).unwrap();
        assert_eq!(resolved.resume_count, Some(5));
    }

    #[tokio::test]
    async fn test_partial_and_failed_outcomes() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        fast.set(&state_key("b1"), &record(&json!({"batch_id": "b1", "resume_count": 1}), 10))
            .await
            .unwrap();
        let orch = orchestrator(registry().with_backend(fast));

        let partial = orch.recover_batch_state("b1", RecoveryOptions::default()).await;
        assert_eq!(partial.status, RecoveryStatus::Partial);
        assert_eq!(partial.partial_state.unwrap().resume_count, Some(1));

        let strict = RecoveryOptions {
            allow_partial_recovery: false,
            ..Default::default()
        };
        let failed = orch.recover_batch_state("b1", strict).await;
        assert_eq!(failed.status, RecoveryStatus::Failed);

        let missing = orch.recover_batch_state("nope", RecoveryOptions::default()).await;
        assert_eq!(missing.status, RecoveryStatus::Failed);
        assert!(missing.partial_state.is_none());

        let stats = orch.stats();
        assert_eq!((stats.attempts, stats.partials, stats.failures), (3, 1, 2));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_source_failure() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        let mut old = record(&full(1, BatchStatus::Ready), 10);
        old["version"] = json!("0.9.0");
        fast.set(&state_key("b1"), &old).await.unwrap();
        let bulk = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        bulk.set(&state_key("b1"), &record(&full(4, BatchStatus::Ready), 10)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast).with_backend(bulk));
        let result = orch.recover_batch_state("b1", RecoveryOptions::default()).await;
        assert_eq!(result.status, RecoveryStatus::Success);
        assert_eq!(result.failed_items, vec![BackendKind::FastLocal]);
        assert!(result.warnings[0].contains(SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn test_preferred_source_goes_first() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        fast.set(&state_key("b1"), &record(&full(1, BatchStatus::Ready), 10)).await.unwrap();
        let remote = Arc::new(MemoryStore::new(BackendKind::RemoteServer));
        remote.set(&state_key("b1"), &record(&full(9, BatchStatus::Ready), 10)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast).with_backend(remote));
        let options = RecoveryOptions {
            preferred_source: Some(BackendKind::RemoteServer),
            ..Default::default()
        };
        let result = orch.recover_batch_state("b1", options).await;
        assert_eq!(result.metadata.sources_tried, vec![BackendKind::RemoteServer]);
        assert_eq!(result.restored_state.unwrap().resume_count, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_result() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        fast.set(&state_key("b1"), &record(&json!({"batch_id": "b1"}), 10)).await.unwrap();
        let bulk = Arc::new(FlakyStore::new(MemoryStore::new(BackendKind::BulkLocal), FailureMode::Transient));
        bulk.inner().set(&state_key("b1"), &record(&full(2, BatchStatus::Ready), 10)).await.unwrap();
        bulk.set_latency(Duration::from_millis(50));

        let orch = orchestrator(registry().with_backend(fast).with_backend(bulk));
        let options = RecoveryOptions {
            timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let result = orch.recover_batch_state("b1", options).await;

        assert_eq!(result.status, RecoveryStatus::Timeout);
        assert!(result.restored_state.is_none());
        assert_eq!(result.partial_state.unwrap().batch_id.as_deref(), Some("b1"));
        assert_eq!(orch.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_run_and_cancel() {
        let fast = Arc::new(FlakyStore::new(MemoryStore::new(BackendKind::FastLocal), FailureMode::Transient));
        fast.set_latency(Duration::from_millis(100));
        let bulk = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        bulk.set(&state_key("b1"), &record(&full(2, BatchStatus::Ready), 10)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast.clone()).with_backend(bulk));
        let a = tokio::spawn({
            let orch = orch.clone();
            async move { orch.recover_batch_state("b1", RecoveryOptions::default()).await }
        });
        let b = tokio::spawn({
            let orch = orch.clone();
            async move { orch.recover_batch_state("b1", RecoveryOptions::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orch.in_flight_count(), 1);
        assert!(orch.cancel_recovery("b1"));

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.status, RecoveryStatus::Cancelled);
        assert_eq!(a, b);
        assert_eq!(fast.calls(), 1);
        assert_eq!(orch.stats().cancellations, 1);
        assert!(!orch.cancel_recovery("b1"));
    }

    #[tokio::test]
    async fn test_write_back_repairs_sources_missing_state() {
        let fast = Arc::new(MemoryStore::new(BackendKind::FastLocal));
        let bulk = Arc::new(MemoryStore::new(BackendKind::BulkLocal));
        bulk.set(&state_key("b1"), &record(&full(2, BatchStatus::Ready), 10)).await.unwrap();

        let orch = orchestrator(registry().with_backend(fast.clone()).with_backend(bulk));
        let options = RecoveryOptions {
            write_back: true,
            ..Default::default()
        };
        let result = orch.recover_batch_state("b1", options).await;
        assert!(result.is_success());

        let repaired = fast.get(&state_key("b1")).await.unwrap().unwrap();
        let record = PersistedRecord::<BatchState>::open(repaired).unwrap();
        assert_eq!(record.state.resume_count, 2);
        assert_eq!(record.metadata.origin.as_deref(), Some("fast-local"));
    }
}
