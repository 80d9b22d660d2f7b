// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Facade pairing the storage router with the recovery orchestrator.
//!
//! State is written to every durable tier recovery reads from, so losing
//! any one of them still leaves a copy to recover. Only when none of them
//! accepts the write does it fall back to normal routing.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::batch_state::{component_key, state_key, BatchComponent, BatchState, PersistedRecord};
use crate::config::{RecoveryConfig, StorageConfig};
use crate::platform::Platform;
use crate::recovery::{ProgressiveRecoveryResult, RecoveryOptions, RecoveryOrchestrator, RecoveryResult};
use crate::router::{DeleteReport, SaveOptions, UnifiedStorage};
use crate::storage::traits::{BackendKind, StorageError};

/// Where a persist landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistReport {
    pub written: Vec<BackendKind>,
    pub failed: Vec<(BackendKind, String)>,
}

impl PersistReport {
    /// At least one copy survives a restart.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.written.iter().any(|kind| *kind != BackendKind::Ephemeral)
    }
}

pub struct BatchVault {
    storage: Arc<UnifiedStorage>,
    recovery: Arc<RecoveryOrchestrator>,
}

impl BatchVault {
    /// Open every configured tier and start background tasks.
    pub async fn open(config: StorageConfig, platform: Arc<dyn Platform>) -> Result<Self, StorageError> {
        let storage = Arc::new(UnifiedStorage::from_config(&config, platform).await?);
        storage.start();
        info!(tiers = ?storage.registry().kinds(), "Batch vault opened");
        Ok(Self::new(storage, config.recovery))
    }

    #[must_use]
    pub fn new(storage: Arc<UnifiedStorage>, recovery: RecoveryConfig) -> Self {
        let recovery = Arc::new(RecoveryOrchestrator::new(Arc::clone(&storage), recovery));
        Self { storage, recovery }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<UnifiedStorage> {
        &self.storage
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    /// Persist a batch's full state.
    #[tracing::instrument(skip(self, state), fields(batch_id = %state.batch_id))]
    pub async fn persist_state(&self, state: &BatchState) -> Result<PersistReport, StorageError> {
        let value = serde_json::to_value(state)?;
        self.persist(&state_key(&state.batch_id), value, &state.batch_id, &state.session_id)
            .await
    }

    /// Persist one component on its own key, recoverable with
    /// [`recover_components`](Self::recover_components).
    #[tracing::instrument(skip(self, value))]
    pub async fn persist_component(
        &self,
        batch_id: &str,
        session_id: &str,
        component: BatchComponent,
        value: Value,
    ) -> Result<PersistReport, StorageError> {
        self.persist(&component_key(batch_id, component), value, batch_id, session_id)
            .await
    }

    async fn persist(&self, key: &str, state: Value, batch_id: &str, session_id: &str) -> Result<PersistReport, StorageError> {
        let now = self.storage.platform().now_millis();
        let mut report = PersistReport::default();

        for kind in self.recovery.source_order(None) {
            let record = PersistedRecord::seal(state.clone(), batch_id, session_id, Some(kind.as_str().to_string()), now)?;
            match self.storage.save_to(kind, key, &record.to_value()?).await {
                Ok(()) => report.written.push(kind),
                Err(e) => {
                    warn!(key, backend = %kind, error = %e, "Persist to recovery source failed");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }

        if report.written.is_empty() {
            let record = PersistedRecord::seal(state, batch_id, session_id, None, now)?;
            let kind = self
                .storage
                .save_with(key, &record.to_value()?, SaveOptions::data_type("batch_state"))
                .await?;
            warn!(key, backend = %kind, "No recovery source accepted the write, stored via routing");
            report.written.push(kind);
        }
        Ok(report)
    }

    pub async fn recover(&self, batch_id: &str, options: RecoveryOptions) -> RecoveryResult {
        self.recovery.recover_batch_state(batch_id, options).await
    }

    pub async fn recover_components(&self, batch_id: &str, components: &[BatchComponent]) -> ProgressiveRecoveryResult {
        self.recovery.progressive_recovery(batch_id, components).await
    }

    /// Remove a batch's state and components from every tier.
    pub async fn forget(&self, batch_id: &str) -> DeleteReport {
        let mut keys = vec![state_key(batch_id)];
        keys.extend(BatchComponent::ALL.iter().map(|c| component_key(batch_id, *c)));

        let mut report = DeleteReport::default();
        for key in keys {
            let removed = self.storage.delete(&key).await;
            for kind in removed.removed_from {
                if !report.removed_from.contains(&kind) {
                    report.removed_from.push(kind);
                }
            }
            report.failed.extend(removed.failed);
        }
        report
    }

    pub async fn shutdown(&self) {
        self.recovery.shutdown();
        self.storage.shutdown().await;
        info!("Batch vault shut down");
    }
}
