// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field-level conflict detection and resolution between two sources.
//!
//! Automatic rules, applied only to fields both sides hold with different
//! values:
//!
//! | Field | Winner |
//! |-------|--------|
//! | `last_validated`, `resume_count` | larger value |
//! | `status` | `Ready` if either side has it, else existing |
//! | anything else | existing (first source queried) |
//!
//! A field present on one side only is not a conflict; the gap is filled.
//! An `error` is therefore never cleared by a source that lacks one.

use std::collections::BTreeSet;

use crate::batch_state::{BatchStatus, PartialBatchState, StateField};

use super::types::{ConflictInfo, ResolutionOption};

/// Fields both states hold with different values.
#[must_use]
pub fn detect_conflicts(existing: &PartialBatchState, incoming: &PartialBatchState) -> BTreeSet<StateField> {
    StateField::ALL
        .iter()
        .copied()
        .filter(|field| existing.has(*field) && incoming.has(*field))
        .filter(|field| !field_equal(existing, incoming, *field))
        .collect()
}

fn field_equal(a: &PartialBatchState, b: &PartialBatchState, field: StateField) -> bool {
    match field {
        StateField::BatchId => a.batch_id == b.batch_id,
        StateField::SessionId => a.session_id == b.session_id,
        StateField::Status => a.status == b.status,
        StateField::ResumeCount => a.resume_count == b.resume_count,
        StateField::LastValidated => a.last_validated == b.last_validated,
        StateField::Error => a.error == b.error,
        StateField::Resumes => a.resumes == b.resumes,
        StateField::Analysis => a.analysis == b.analysis,
        StateField::Metadata => a.metadata == b.metadata,
    }
}

/// Which side a resolved field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Existing,
    Incoming,
}

/// One automatic decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldResolution {
    pub field: StateField,
    pub winner: Winner,
    pub rule: &'static str,
}

impl FieldResolution {
    #[must_use]
    pub fn describe(&self) -> String {
        let side = match self.winner {
            Winner::Existing => "kept existing value",
            Winner::Incoming => "took incoming value",
        };
        format!("auto-resolved '{}': {side} ({})", self.field, self.rule)
    }
}

/// Merge `incoming` into `existing` with the automatic rules.
///
/// Pure: identical inputs always give identical output.
#[must_use]
pub fn auto_resolve(existing: &PartialBatchState, incoming: &PartialBatchState) -> (PartialBatchState, Vec<FieldResolution>) {
    let mut merged = existing.clone();
    let mut decisions = Vec::new();

    for field in detect_conflicts(existing, incoming) {
        let (winner, rule) = match field {
            StateField::LastValidated => {
                let take = incoming.last_validated > existing.last_validated;
                if take {
                    merged.last_validated = incoming.last_validated;
                }
                (take, "newer timestamp")
            }
            StateField::ResumeCount => {
                let take = incoming.resume_count > existing.resume_count;
                if take {
                    merged.resume_count = incoming.resume_count;
                }
                (take, "larger count")
            }
            StateField::Status => {
                let take = incoming.status == Some(BatchStatus::Ready);
                if take {
                    merged.status = incoming.status;
                }
                (take, "ready wins")
            }
            StateField::Error => (false, "existing error kept"),
            _ => (false, "existing value kept"),
        };
        decisions.push(FieldResolution {
            field,
            winner: if winner { Winner::Incoming } else { Winner::Existing },
            rule,
        });
    }

    merged.fill_missing_from(incoming);
    (merged, decisions)
}

impl ConflictInfo {
    /// Resolve with one of the offered strategies. `None` for
    /// [`ResolutionOption::Manual`], which the caller must do itself.
    #[must_use]
    pub fn resolve(&self, option: ResolutionOption) -> Option<PartialBatchState> {
        match option {
            ResolutionOption::UseExisting => {
                let mut merged = self.existing.clone();
                merged.fill_missing_from(&self.incoming);
                Some(merged)
            }
            ResolutionOption::UseNewer => {
                let (newer, older) = if self.incoming_timestamp > self.existing_timestamp {
                    (&self.incoming, &self.existing)
                } else {
                    (&self.existing, &self.incoming)
                };
                let mut merged = newer.clone();
                merged.fill_missing_from(older);
                Some(merged)
            }
            ResolutionOption::MergeSafeFields => Some(auto_resolve(&self.existing, &self.incoming).0),
            ResolutionOption::Manual => None,
        }
    }
}

/// Every option is offered; `UseNewer` is meaningless without timestamps
/// that differ, so it is left out then.
#[must_use]
pub fn resolution_options(existing_timestamp: i64, incoming_timestamp: i64) -> Vec<ResolutionOption> {
    let mut options = Vec::with_capacity(4);
    if existing_timestamp != incoming_timestamp {
        options.push(ResolutionOption::UseNewer);
    }
    options.extend([
        ResolutionOption::UseExisting,
        ResolutionOption::MergeSafeFields,
        ResolutionOption::Manual,
    ]);
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_state::BatchError;
    use crate::storage::traits::BackendKind;

    fn state(resume_count: u32, status: BatchStatus, last_validated: i64) -> PartialBatchState {
        PartialBatchState {
            batch_id: Some("b1".into()),
            session_id: Some("s1".into()),
            status: Some(status),
            resume_count: Some(resume_count),
            last_validated: Some(last_validated),
            ..Default::default()
        }
    }

    #[test]
    fn test_detects_only_fields_present_on_both_sides() {
        let existing = PartialBatchState {
            resume_count: Some(3),
            status: Some(BatchStatus::Validating),
            ..Default::default()
        };
        let incoming = state(5, BatchStatus::Ready, 10);
        let fields = detect_conflicts(&existing, &incoming);
        assert_eq!(fields, BTreeSet::from([StateField::Status, StateField::ResumeCount]));
    }

    #[test]
    fn test_auto_resolution_rules() {
        let existing = state(3, BatchStatus::Validating, 200);
        let incoming = state(5, BatchStatus::Ready, 100);
        let (merged, decisions) = auto_resolve(&existing, &incoming);

        assert_eq!(merged.resume_count, Some(5));
        assert_eq!(merged.status, Some(BatchStatus::Ready));
        assert_eq!(merged.last_validated, Some(200));
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().any(|d| d.field == StateField::LastValidated && d.winner == Winner::Existing));
    }

    #[test]
    fn test_ready_is_not_displaced() {
        let existing = state(1, BatchStatus::Ready, 1);
        let incoming = state(1, BatchStatus::Error, 1);
        let (merged, _) = auto_resolve(&existing, &incoming);
        assert_eq!(merged.status, Some(BatchStatus::Ready));
    }

    #[test]
    fn test_error_never_cleared_by_absence() {
        let mut existing = state(1, BatchStatus::Error, 1);
        existing.error = Some(BatchError {
            kind: "upload".into(),
            message: "timed out".into(),
            occurred_at: 1,
        });
        let incoming = state(1, BatchStatus::Error, 1);
        let (merged, decisions) = auto_resolve(&existing, &incoming);
        assert!(merged.error.is_some());
        assert!(decisions.is_empty());

        // And an incoming error fills a gap
        let (merged, _) = auto_resolve(&incoming, &existing);
        assert!(merged.error.is_some());
    }

    #[test]
    fn test_unrecognised_fields_keep_existing() {
        let mut existing = state(1, BatchStatus::Ready, 1);
        existing.session_id = Some("first".into());
        let mut incoming = state(1, BatchStatus::Ready, 1);
        incoming.session_id = Some("second".into());
        let (merged, decisions) = auto_resolve(&existing, &incoming);
        assert_eq!(merged.session_id.as_deref(), Some("first"));
        assert_eq!(decisions[0].describe(), "auto-resolved 'session_id': kept existing value (existing value kept)");
    }

    #[test]
    fn test_conflict_info_resolutions() {
        let existing = state(3, BatchStatus::Validating, 100);
        let incoming = state(5, BatchStatus::Ready, 50);
        let info = ConflictInfo {
            conflict_fields: detect_conflicts(&existing, &incoming),
            resolution_options: resolution_options(10, 20),
            existing_source: BackendKind::FastLocal,
            incoming_source: BackendKind::RemoteServer,
            existing: existing.clone(),
            incoming: incoming.clone(),
            existing_timestamp: 10,
            incoming_timestamp: 20,
        };

        assert_eq!(info.resolve(ResolutionOption::UseNewer), Some(incoming.clone()));
        assert_eq!(info.resolve(ResolutionOption::UseExisting), Some(existing));
        let safe = info.resolve(ResolutionOption::MergeSafeFields).unwrap();
        assert_eq!((safe.resume_count, safe.status, safe.last_validated), (Some(5), Some(BatchStatus::Ready), Some(100)));
        assert_eq!(info.resolve(ResolutionOption::Manual), None);
    }

    #[test]
    fn test_use_newer_omitted_for_equal_timestamps() {
        assert!(!resolution_options(5, 5).contains(&ResolutionOption::UseNewer));
        assert_eq!(resolution_options(5, 6).len(), 4);
    }
}
