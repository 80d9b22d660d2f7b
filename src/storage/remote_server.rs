// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-server tier.
//!
//! Endpoints, relative to `base_url`:
//! - `GET|POST|DELETE /batches/{key}/state`
//! - `GET /batches/states` → `["key", ...]`
//! - `GET /batches/quota` → `StorageQuota`
//! - `POST /batches/cleanup` → `{"removed": n}`
//! - `GET /batches/{batch_id}/status` → [`RemoteBatchStatus`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::http::{expect_found, status_error, transport_error, HttpTier};
use super::traits::{payload_size, BackendKind, StorageBackend, StorageError, StorageQuota};
use crate::config::RemoteServerConfig;
use crate::platform::Platform;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::RetryPolicy;

const KIND: BackendKind = BackendKind::RemoteServer;

/// Server-side view of a batch, independent of any stored state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBatchStatus {
    pub exists: bool,
    #[serde(default)]
    pub resume_count: u32,
    /// Whether this client may resume the batch
    #[serde(default)]
    pub claimable: bool,
}

#[derive(Debug, Deserialize)]
struct CleanupResponse {
    removed: usize,
}

pub struct RemoteServerStore {
    http: HttpTier,
}

impl RemoteServerStore {
    pub fn new(
        config: &RemoteServerConfig,
        retry: RetryPolicy,
        circuit: Option<Arc<CircuitBreaker>>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, StorageError> {
        let http = HttpTier::new(
            KIND,
            &config.base_url,
            config.auth_token.clone(),
            Duration::from_millis(config.request_timeout_ms),
            retry,
            circuit,
            platform,
        )?;
        Ok(Self { http })
    }

    #[must_use]
    pub fn circuit(&self) -> Option<&Arc<CircuitBreaker>> {
        self.http.circuit()
    }

    /// Ask the server what it knows about a batch. `None` when the server
    /// has never heard of it.
    #[tracing::instrument(skip(self))]
    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<RemoteBatchStatus>, StorageError> {
        let url = self.http.url(&["batches", batch_id, "status"]);
        self.http
            .call("remote_server_status", batch_id, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => Ok(Some(
                        resp.json::<RemoteBatchStatus>().await.map_err(|e| transport_error(KIND, e))?,
                    )),
                    None => Ok(None),
                }
            })
            .await
    }
}

#[async_trait]
impl StorageBackend for RemoteServerStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn is_available(&self) -> bool {
        self.http.is_available()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let url = self.http.url(&["batches", key, "state"]);
        self.http
            .call("remote_server_get", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => Ok(Some(resp.json::<Value>().await.map_err(|e| transport_error(KIND, e))?)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let url = self.http.url(&["batches", key, "state"]);
        let size = payload_size(value)?;
        self.http
            .call("remote_server_set", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().post(url.clone()).json(value))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let body = resp.text().await.unwrap_or_default();
                Err(status_error(KIND, status, &body, size))
            })
            .await?;
        crate::metrics::record_bytes_written(KIND.as_str(), size);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let url = self.http.url(&["batches", key, "state"]);
        self.http
            .call("remote_server_remove", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().delete(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                // Deleting something already gone is fine
                expect_found(KIND, resp, 0).await.map(|_| ())
            })
            .await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let url = self.http.url(&["batches", "states"]);
        self.http
            .call("remote_server_list", "states", || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => resp.json::<Vec<String>>().await.map_err(|e| transport_error(KIND, e)),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        let url = self.http.url(&["batches", "quota"]);
        self.http
            .call("remote_server_quota", "quota", || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => resp.json::<StorageQuota>().await.map_err(|e| transport_error(KIND, e)),
                    None => Err(StorageError::Backend("remote-server has no quota endpoint".into())),
                }
            })
            .await
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        let url = self.http.url(&["batches", "cleanup"]);
        let removed = self
            .http
            .call("remote_server_cleanup", "cleanup", || async {
                let resp = self
                    .http
                    .authorize(self.http.client().post(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => Ok(resp
                        .json::<CleanupResponse>()
                        .await
                        .map_err(|e| transport_error(KIND, e))?
                        .removed),
                    None => Ok(0),
                }
            })
            .await?;
        debug!(removed, "Remote-server cleanup finished");
        Ok(removed)
    }
}
