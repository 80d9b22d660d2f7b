// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch state and its persisted envelope.
//!
//! A [`PersistedRecord`] wraps whatever state is written to a tier with a
//! schema version and a SHA-256 checksum of the state's canonical JSON.
//! Records from another schema version are rejected, never migrated. A
//! checksum mismatch is not an error: the record is returned with its
//! sync status set to [`SyncStatus::Diverged`] so the caller can decide.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::storage::traits::StorageError;

/// Schema version stamped on every record this build writes.
pub const SCHEMA_VERSION: &str = "1.0.0";

const KEY_PREFIX: &str = "batch_vault:state:";

/// Storage key of a batch's full state record.
#[must_use]
pub fn state_key(batch_id: &str) -> String {
    format!("{KEY_PREFIX}{batch_id}")
}

/// Storage key of one independently persisted component of a batch.
#[must_use]
pub fn component_key(batch_id: &str, component: BatchComponent) -> String {
    format!("{KEY_PREFIX}{batch_id}:{}", component.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Initializing,
    Ready,
    Validating,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub kind: String,
    pub message: String,
    /// Epoch millis
    pub occurred_at: i64,
}

/// Complete state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub session_id: String,
    pub status: BatchStatus,
    pub resume_count: u32,
    /// Epoch millis of the last successful validation
    pub last_validated: i64,
    #[serde(default)]
    pub error: Option<BatchError>,
    #[serde(default)]
    pub resumes: Option<Vec<Value>>,
    #[serde(default)]
    pub analysis: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl BatchState {
    #[must_use]
    pub fn new(batch_id: impl Into<String>, session_id: impl Into<String>, now_millis: i64) -> Self {
        Self {
            batch_id: batch_id.into(),
            session_id: session_id.into(),
            status: BatchStatus::Initializing,
            resume_count: 0,
            last_validated: now_millis,
            error: None,
            resumes: None,
            analysis: None,
            metadata: None,
        }
    }
}

/// State fields that take part in merging and conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    BatchId,
    SessionId,
    Status,
    ResumeCount,
    LastValidated,
    Error,
    Resumes,
    Analysis,
    Metadata,
}

impl StateField {
    pub const ALL: [StateField; 9] = [
        StateField::BatchId,
        StateField::SessionId,
        StateField::Status,
        StateField::ResumeCount,
        StateField::LastValidated,
        StateField::Error,
        StateField::Resumes,
        StateField::Analysis,
        StateField::Metadata,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchId => "batch_id",
            Self::SessionId => "session_id",
            Self::Status => "status",
            Self::ResumeCount => "resume_count",
            Self::LastValidated => "last_validated",
            Self::Error => "error",
            Self::Resumes => "resumes",
            Self::Analysis => "analysis",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for StateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-resources that can be recovered independently of the full state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchComponent {
    Resumes,
    Analysis,
    Metadata,
}

impl BatchComponent {
    pub const ALL: [BatchComponent; 3] = [BatchComponent::Resumes, BatchComponent::Analysis, BatchComponent::Metadata];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resumes => "resumes",
            Self::Analysis => "analysis",
            Self::Metadata => "metadata",
        }
    }

    #[must_use]
    pub fn field(&self) -> StateField {
        match self {
            Self::Resumes => StateField::Resumes,
            Self::Analysis => StateField::Analysis,
            Self::Metadata => StateField::Metadata,
        }
    }
}

/// Batch state as accumulated during recovery. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialBatchState {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: Option<BatchStatus>,
    #[serde(default)]
    pub resume_count: Option<u32>,
    #[serde(default)]
    pub last_validated: Option<i64>,
    #[serde(default)]
    pub error: Option<BatchError>,
    #[serde(default)]
    pub resumes: Option<Vec<Value>>,
    #[serde(default)]
    pub analysis: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl PartialBatchState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        StateField::ALL.iter().all(|field| !self.has(*field))
    }

    /// Whether the field is present. Empty strings count as missing.
    #[must_use]
    pub fn has(&self, field: StateField) -> bool {
        match field {
            StateField::BatchId => self.batch_id.as_deref().is_some_and(|s| !s.is_empty()),
            StateField::SessionId => self.session_id.as_deref().is_some_and(|s| !s.is_empty()),
            StateField::Status => self.status.is_some(),
            StateField::ResumeCount => self.resume_count.is_some(),
            StateField::LastValidated => self.last_validated.is_some(),
            StateField::Error => self.error.is_some(),
            StateField::Resumes => self.resumes.is_some(),
            StateField::Analysis => self.analysis.is_some(),
            StateField::Metadata => self.metadata.is_some(),
        }
    }

    /// Enough to resume the workflow: identity, status and a validation time.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.has(StateField::BatchId)
            && self.has(StateField::SessionId)
            && self.has(StateField::Status)
            && self.has(StateField::LastValidated)
    }

    #[must_use]
    pub fn present_fields(&self) -> Vec<StateField> {
        StateField::ALL.iter().copied().filter(|f| self.has(*f)).collect()
    }

    /// Fill every field missing here from `other`. Present fields are kept.
    pub fn fill_missing_from(&mut self, other: &PartialBatchState) {
        if !self.has(StateField::BatchId) {
            self.batch_id.clone_from(&other.batch_id);
        }
        if !self.has(StateField::SessionId) {
            self.session_id.clone_from(&other.session_id);
        }
        self.status = self.status.or(other.status);
        self.resume_count = self.resume_count.or(other.resume_count);
        self.last_validated = self.last_validated.or(other.last_validated);
        if self.error.is_none() {
            self.error.clone_from(&other.error);
        }
        if self.resumes.is_none() {
            self.resumes.clone_from(&other.resumes);
        }
        if self.analysis.is_none() {
            self.analysis.clone_from(&other.analysis);
        }
        if self.metadata.is_none() {
            self.metadata.clone_from(&other.metadata);
        }
    }

    /// Convert into a full state. `None` unless [`is_complete`](Self::is_complete).
    #[must_use]
    pub fn into_state(self) -> Option<BatchState> {
        if !self.is_complete() {
            return None;
        }
        Some(BatchState {
            batch_id: self.batch_id?,
            session_id: self.session_id?,
            status: self.status?,
            resume_count: self.resume_count.unwrap_or(0),
            last_validated: self.last_validated?,
            error: self.error,
            resumes: self.resumes,
            analysis: self.analysis,
            metadata: self.metadata,
        })
    }
}

impl From<BatchState> for PartialBatchState {
    fn from(state: BatchState) -> Self {
        Self {
            batch_id: Some(state.batch_id),
            session_id: Some(state.session_id),
            status: Some(state.status),
            resume_count: Some(state.resume_count),
            last_validated: Some(state.last_validated),
            error: state.error,
            resumes: state.resumes,
            analysis: state.analysis,
            metadata: state.metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Diverged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub checksum: String,
    #[serde(default = "default_sync_status")]
    pub sync_status: SyncStatus,
    /// Tier or component that produced the record
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub access_count: u64,
}

fn default_sync_status() -> SyncStatus {
    SyncStatus::Pending
}

/// Versioned, checksummed envelope around persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord<T> {
    pub version: String,
    /// Epoch millis at which the record was sealed
    pub timestamp: i64,
    pub batch_id: String,
    pub session_id: String,
    pub state: T,
    pub metadata: RecordMetadata,
}

/// SHA-256 hex of a JSON value's serialized form.
///
/// `serde_json::Map` keeps keys sorted, so equal values hash equally
/// regardless of the order fields were inserted in.
#[must_use]
pub fn checksum(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl<T> PersistedRecord<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn seal(
        state: T,
        batch_id: impl Into<String>,
        session_id: impl Into<String>,
        origin: Option<String>,
        now_millis: i64,
    ) -> Result<Self, StorageError> {
        let checksum = checksum(&serde_json::to_value(&state)?);
        Ok(Self {
            version: SCHEMA_VERSION.to_string(),
            timestamp: now_millis,
            batch_id: batch_id.into(),
            session_id: session_id.into(),
            state,
            metadata: RecordMetadata {
                checksum,
                sync_status: SyncStatus::Pending,
                origin,
                access_count: 0,
            },
        })
    }

    pub fn to_value(&self) -> Result<Value, StorageError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored record.
    ///
    /// The version is checked before anything else is interpreted. The
    /// checksum is recomputed over the raw stored state.
    pub fn open(value: Value) -> Result<Self, StorageError> {
        let version = value.get("version").and_then(Value::as_str).unwrap_or("<missing>");
        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                found: version.to_string(),
                expected: SCHEMA_VERSION.to_string(),
            });
        }

        let raw: PersistedRecord<Value> = serde_json::from_value(value)?;
        let actual = checksum(&raw.state);
        let mut metadata = raw.metadata;
        if actual != metadata.checksum {
            warn!(
                batch_id = %raw.batch_id,
                stored = %metadata.checksum,
                actual = %actual,
                "Checksum mismatch, record marked diverged"
            );
            crate::metrics::record_divergence(metadata.origin.as_deref().unwrap_or("unknown"));
            metadata.sync_status = SyncStatus::Diverged;
        }

        let state = serde_json::from_value(raw.state)?;
        Ok(Self {
            version: raw.version,
            timestamp: raw.timestamp,
            batch_id: raw.batch_id,
            session_id: raw.session_id,
            state,
            metadata,
        })
    }

    #[must_use]
    pub fn is_diverged(&self) -> bool {
        self.metadata.sync_status == SyncStatus::Diverged
    }
}
