// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The set of tiers a router works over.
//!
//! Built from [`StorageConfig`] (one entry per configured tier) or assembled
//! by hand. The ephemeral tier is always present. Remote tiers share the
//! registry's per-kind circuit breakers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::bulk_local::BulkLocalStore;
use super::ephemeral::EphemeralStore;
use super::fast_local::FastLocalStore;
use super::remote_object::RemoteObjectStore;
use super::remote_server::RemoteServerStore;
use super::traits::{BackendKind, StorageBackend, StorageError};
use crate::config::{EphemeralConfig, StorageConfig};
use crate::platform::Platform;
use crate::resilience::circuit_breaker::{BackendCircuits, CircuitConfig};

pub struct BackendRegistry {
    backends: BTreeMap<BackendKind, Arc<dyn StorageBackend>>,
    /// Concrete handle for the sweep task; `None` once replaced by another store
    ephemeral: Option<Arc<EphemeralStore>>,
    bulk_local: Option<Arc<BulkLocalStore>>,
    remote_server: Option<Arc<RemoteServerStore>>,
    circuits: Arc<BackendCircuits>,
    platform: Arc<dyn Platform>,
}

impl BackendRegistry {
    /// Registry holding only the ephemeral tier.
    pub fn new(ephemeral: &EphemeralConfig, circuit: CircuitConfig, platform: Arc<dyn Platform>) -> Self {
        let store = Arc::new(EphemeralStore::new(ephemeral, platform.clone()));
        let mut backends: BTreeMap<BackendKind, Arc<dyn StorageBackend>> = BTreeMap::new();
        backends.insert(BackendKind::Ephemeral, store.clone());
        Self {
            backends,
            ephemeral: Some(store),
            bulk_local: None,
            remote_server: None,
            circuits: Arc::new(BackendCircuits::new(circuit)),
            platform,
        }
    }

    /// Open every configured tier.
    ///
    /// A local tier that cannot be opened is left out with a warning so the
    /// router can still run on what remains. Invalid remote settings are a
    /// configuration error.
    #[tracing::instrument(skip_all)]
    pub async fn from_config(config: &StorageConfig, platform: Arc<dyn Platform>) -> Result<Self, StorageError> {
        config.validate()?;
        let mut registry = Self::new(&config.ephemeral, config.circuit.clone(), platform.clone());

        if let Some(fast) = &config.fast_local {
            match FastLocalStore::open(fast.clone(), platform.clone()).await {
                Ok(store) => registry.register(Arc::new(store)),
                Err(e) => warn!(path = %fast.path.display(), error = %e, "Fast-local tier unavailable, skipping"),
            }
        }

        if let Some(bulk) = &config.bulk_local {
            match BulkLocalStore::open(bulk.clone(), platform.clone()).await {
                Ok(store) => {
                    let store = Arc::new(store);
                    registry.register(store.clone());
                    registry.bulk_local = Some(store);
                }
                Err(e) => warn!(error = %e, "Bulk-local tier unavailable, skipping"),
            }
        }

        if let Some(server) = &config.remote_server {
            let circuit = registry.circuits.get(BackendKind::RemoteServer);
            let store = RemoteServerStore::new(server, config.retry.clone(), Some(circuit), platform.clone())?;
            registry.register_remote_server(Arc::new(store));
        }

        if let Some(object) = &config.remote_object {
            let circuit = registry.circuits.get(BackendKind::RemoteObject);
            let store = RemoteObjectStore::new(object, config.retry.clone(), Some(circuit), platform.clone())?;
            registry.register(Arc::new(store));
        }

        info!(tiers = ?registry.kinds(), "Storage tiers registered");
        Ok(registry)
    }

    /// Add a tier, replacing any previous tier of the same kind.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        let kind = backend.kind();
        match kind {
            BackendKind::Ephemeral => self.ephemeral = None,
            BackendKind::BulkLocal => self.bulk_local = None,
            BackendKind::RemoteServer => self.remote_server = None,
            _ => {}
        }
        self.backends.insert(kind, backend);
    }

    /// Register the application server, keeping the concrete handle for
    /// batch status lookups.
    pub fn register_remote_server(&mut self, store: Arc<RemoteServerStore>) {
        self.register(store.clone());
        self.remote_server = Some(store);
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.register(backend);
        self
    }

    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(&kind)
    }

    #[must_use]
    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered kinds, fastest first.
    #[must_use]
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, &Arc<dyn StorageBackend>)> {
        self.backends.iter().map(|(kind, backend)| (*kind, backend))
    }

    #[must_use]
    pub fn ephemeral_store(&self) -> Option<&Arc<EphemeralStore>> {
        self.ephemeral.as_ref()
    }

    #[must_use]
    pub fn remote_server(&self) -> Option<&Arc<RemoteServerStore>> {
        self.remote_server.as_ref()
    }

    #[must_use]
    pub fn circuits(&self) -> &Arc<BackendCircuits> {
        &self.circuits
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Release pooled connections held by local tiers.
    pub async fn close(&self) {
        if let Some(bulk) = &self.bulk_local {
            bulk.close().await;
        }
    }
}
