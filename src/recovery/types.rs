// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the recovery orchestrator.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::batch_state::{BatchComponent, BatchState, PartialBatchState, StateField};
use crate::storage::traits::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Success,
    Partial,
    Failed,
    Conflict,
    Cancelled,
    Timeout,
}

impl RecoveryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How disagreements between sources are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Apply the field rules and keep going
    #[default]
    Auto,
    /// Stop and hand the conflict to the caller
    Manual,
}

/// Strategies offered to a caller resolving a conflict by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOption {
    /// Take the record with the later timestamp, fill gaps from the other
    UseNewer,
    /// Keep what was recovered first, fill gaps from the other
    UseExisting,
    /// Apply the per-field automatic rules
    MergeSafeFields,
    /// Caller edits the state itself
    Manual,
}

/// Two sources that disagree, as returned by a manual-mode recovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictInfo {
    pub conflict_fields: BTreeSet<StateField>,
    pub resolution_options: Vec<ResolutionOption>,
    pub existing_source: BackendKind,
    pub incoming_source: BackendKind,
    pub existing: PartialBatchState,
    pub incoming: PartialBatchState,
    /// Record timestamps (epoch millis), used by [`ResolutionOption::UseNewer`]
    pub existing_timestamp: i64,
    pub incoming_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOptions {
    /// Return what was found when no source yields a complete state
    pub allow_partial_recovery: bool,
    /// Consulted before the configured order
    pub preferred_source: Option<BackendKind>,
    pub conflict_resolution: ConflictResolution,
    /// Overrides the configured recovery timeout
    pub timeout: Option<Duration>,
    /// After a successful recovery, rewrite the merged state to the sources
    /// that were missing it or held an incomplete copy
    pub write_back: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            allow_partial_recovery: true,
            preferred_source: None,
            conflict_resolution: ConflictResolution::Auto,
            timeout: None,
            write_back: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryMetadata {
    pub recovery_id: Uuid,
    /// Source that completed (or last contributed to) the state
    pub source: Option<BackendKind>,
    pub sources_tried: Vec<BackendKind>,
    #[serde(with = "crate::config::duration_ms")]
    pub duration: Duration,
    /// Sequence number of this recovery run within the orchestrator
    pub attempt: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub status: RecoveryStatus,
    pub batch_id: String,
    /// Set on `Success`
    pub restored_state: Option<BatchState>,
    /// Whatever was accumulated, set on every other status that found data
    pub partial_state: Option<PartialBatchState>,
    /// Sources that contributed data
    pub recovered_items: Vec<BackendKind>,
    /// Sources that failed or held unusable records
    pub failed_items: Vec<BackendKind>,
    pub warnings: Vec<String>,
    pub conflict: Option<ConflictInfo>,
    pub metadata: RecoveryMetadata,
}

impl RecoveryResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RecoveryStatus::Success
    }
}

/// Running totals across every recovery the orchestrator has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub partials: u64,
    pub failures: u64,
    pub conflicts: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    #[serde(with = "crate::config::duration_ms")]
    pub total_duration: Duration,
}

impl RecoveryStats {
    pub(super) fn record(&mut self, status: RecoveryStatus, duration: Duration) {
        self.attempts += 1;
        self.total_duration += duration;
        match status {
            RecoveryStatus::Success => self.successes += 1,
            RecoveryStatus::Partial => self.partials += 1,
            RecoveryStatus::Failed => self.failures += 1,
            RecoveryStatus::Conflict => self.conflicts += 1,
            RecoveryStatus::Timeout => self.timeouts += 1,
            RecoveryStatus::Cancelled => self.cancellations += 1,
        }
    }

    #[must_use]
    pub fn average_duration(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.attempts as u32
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Recovered,
    Missing,
    Failed,
}

/// Outcome for one component of a progressive recovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentRecovery {
    pub component: BatchComponent,
    pub status: ComponentStatus,
    pub value: Option<Value>,
    pub source: Option<BackendKind>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressiveRecoveryResult {
    pub batch_id: String,
    pub components: Vec<ComponentRecovery>,
}

impl ProgressiveRecoveryResult {
    #[must_use]
    pub fn get(&self, component: BatchComponent) -> Option<&ComponentRecovery> {
        self.components.iter().find(|c| c.component == component)
    }

    #[must_use]
    pub fn recovered(&self) -> Vec<BatchComponent> {
        self.components
            .iter()
            .filter(|c| c.status == ComponentStatus::Recovered)
            .map(|c| c.component)
            .collect()
    }
}
