// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Component-by-component recovery.
//!
//! Each requested component is looked up on its own, so one unreadable
//! component never hides the others:
//!
//! 1. the component's own key on each source, in recovery order
//! 2. the matching field of the full state record on each source
//! 3. metadata only: the server's batch status endpoint

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::types::{ComponentRecovery, ComponentStatus, ProgressiveRecoveryResult};
use super::RecoveryOrchestrator;
use crate::batch_state::{component_key, state_key, BatchComponent, PartialBatchState, PersistedRecord};
use crate::storage::traits::{BackendKind, StorageError};

type FullRecords = Vec<(BackendKind, Result<Option<PartialBatchState>, String>)>;

fn embedded(state: &PartialBatchState, component: BatchComponent) -> Option<Value> {
    match component {
        BatchComponent::Resumes => state.resumes.clone().map(Value::Array),
        BatchComponent::Analysis => state.analysis.clone(),
        BatchComponent::Metadata => state.metadata.clone().map(Value::Object),
    }
}

impl RecoveryOrchestrator {
    /// Recover the requested components independently and concurrently.
    #[tracing::instrument(skip(self, components))]
    pub async fn progressive_recovery(&self, batch_id: &str, components: &[BatchComponent]) -> ProgressiveRecoveryResult {
        let sources = self.source_order(None);
        let full_records = OnceCell::new();

        let recoveries = components
            .iter()
            .map(|component| self.recover_component(batch_id, *component, &sources, &full_records));
        let components = join_all(recoveries).await;

        debug!(
            batch_id,
            recovered = components.iter().filter(|c| c.status == ComponentStatus::Recovered).count(),
            requested = components.len(),
            "Progressive recovery finished"
        );
        ProgressiveRecoveryResult {
            batch_id: batch_id.to_string(),
            components,
        }
    }

    async fn recover_component(
        &self,
        batch_id: &str,
        component: BatchComponent,
        sources: &[BackendKind],
        full_records: &OnceCell<FullRecords>,
    ) -> ComponentRecovery {
        let mut errors = Vec::new();
        let found = |value: Value, source: BackendKind, errors: Vec<String>| ComponentRecovery {
            component,
            status: ComponentStatus::Recovered,
            value: Some(value),
            source: Some(source),
            errors,
        };

        let key = component_key(batch_id, component);
        for &kind in sources {
            let loaded = self
                .storage
                .load_from(kind, &key)
                .await
                .and_then(|value| value.map(PersistedRecord::<Value>::open).transpose());
            match loaded {
                Ok(Some(record)) => return found(record.state, kind, errors),
                Ok(None) => {}
                Err(e) => errors.push(format!("{kind}: {e}")),
            }
        }

        let records = full_records
            .get_or_init(|| self.load_full_records(batch_id, sources))
            .await;
        for (kind, record) in records {
            match record {
                Ok(Some(state)) => {
                    if let Some(value) = embedded(state, component) {
                        return found(value, *kind, errors);
                    }
                }
                Ok(None) => {}
                Err(e) => errors.push(format!("{kind}: {e}")),
            }
        }

        if component == BatchComponent::Metadata {
            if let Some(remote) = self.storage.remote_server() {
                match remote.batch_status(batch_id).await {
                    Ok(Some(status)) => match serde_json::to_value(status) {
                        Ok(value) => return found(value, BackendKind::RemoteServer, errors),
                        Err(e) => errors.push(format!("{}: {e}", BackendKind::RemoteServer)),
                    },
                    Ok(None) => {}
                    Err(e) => errors.push(format!("{}: {e}", BackendKind::RemoteServer)),
                }
            }
        }

        ComponentRecovery {
            component,
            status: if errors.is_empty() {
                ComponentStatus::Missing
            } else {
                ComponentStatus::Failed
            },
            value: None,
            source: None,
            errors,
        }
    }

    async fn load_full_records(&self, batch_id: &str, sources: &[BackendKind]) -> FullRecords {
        let key = state_key(batch_id);
        let mut records = Vec::with_capacity(sources.len());
        for &kind in sources {
            let record = self
                .storage
                .load_from(kind, &key)
                .await
                .and_then(|value| value.map(PersistedRecord::<PartialBatchState>::open).transpose())
                .and_then(|record| match record {
                    Some(r) if r.batch_id != batch_id => Err(StorageError::Backend(format!(
                        "record belongs to batch '{}'",
                        r.batch_id
                    ))),
                    other => Ok(other.map(|r| r.state)),
                })
                .map_err(|e| e.to_string());
            records.push((kind, record));
        }
        records
    }
}
