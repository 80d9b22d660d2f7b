// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object-store tier.
//!
//! Values are wrapped in an [`ObjectEnvelope`] whose flags record exactly
//! which transforms were applied on the way in (zstd, then AES-256-GCM, then
//! base64), so `get` can undo them without consulting current config.
//!
//! Endpoints, relative to `base_url`:
//! - `GET|PUT|DELETE /{bucket}/{key}`
//! - `GET /{bucket}?list` → `[{key, size, last_modified}]`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::http::{expect_found, status_error, transport_error, HttpTier};
use super::traits::{BackendKind, StorageBackend, StorageError, StorageQuota};
use crate::compression;
use crate::config::RemoteObjectConfig;
use crate::encryption::PayloadCipher;
use crate::platform::Platform;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::RetryPolicy;

const KIND: BackendKind = BackendKind::RemoteObject;
const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEnvelope {
    pub version: u32,
    pub compressed: bool,
    pub encrypted: bool,
    /// Epoch millis
    pub stored_at: i64,
    /// Base64 of the (possibly compressed, possibly encrypted) JSON bytes
    pub payload: String,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Epoch millis
    pub last_modified: i64,
}

pub struct RemoteObjectStore {
    http: HttpTier,
    bucket: String,
    compress: bool,
    cipher: Option<PayloadCipher>,
    max_size_bytes: u64,
    max_age_ms: u64,
    platform: Arc<dyn Platform>,
}

impl RemoteObjectStore {
    pub fn new(
        config: &RemoteObjectConfig,
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
            platform.clone(),
        )?;
        let cipher = config
            .encryption_key_hex
            .as_deref()
            .map(PayloadCipher::from_hex)
            .transpose()?;
        let compress = config.compress && compression::is_available();
        if config.compress && !compress {
            warn!("Remote-object compression requested but the `compression` feature is disabled");
        }
        Ok(Self {
            http,
            bucket: config.bucket.clone(),
            compress,
            cipher,
            max_size_bytes: config.max_size_bytes,
            max_age_ms: config.max_age_ms,
            platform,
        })
    }

    #[must_use]
    pub fn circuit(&self) -> Option<&Arc<CircuitBreaker>> {
        self.http.circuit()
    }

    /// Serialize and wrap a value the way it is stored.
    pub fn seal(&self, value: &Value) -> Result<ObjectEnvelope, StorageError> {
        let mut bytes = serde_json::to_vec(value)?;
        if self.compress {
            bytes = compression::compress(&bytes)?;
        }
        if let Some(cipher) = &self.cipher {
            bytes = cipher.encrypt(&bytes)?;
        }
        Ok(ObjectEnvelope {
            version: ENVELOPE_VERSION,
            compressed: self.compress,
            encrypted: self.cipher.is_some(),
            stored_at: self.platform.now_millis(),
            payload: BASE64.encode(bytes),
        })
    }

    /// Reverse exactly the transforms the envelope says were applied.
    pub fn open(&self, envelope: &ObjectEnvelope) -> Result<Value, StorageError> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                found: envelope.version.to_string(),
                expected: ENVELOPE_VERSION.to_string(),
            });
        }
        let mut bytes = BASE64.decode(envelope.payload.as_bytes()).map_err(StorageError::serialization)?;
        if envelope.encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig("object is encrypted but no encryption key is configured".into())
            })?;
            bytes = cipher.decrypt(&bytes)?;
        }
        if envelope.compressed {
            bytes = compression::decompress(&bytes)?;
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Full bucket listing with sizes and timestamps.
    pub async fn list_objects(&self) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut url = self.http.url(&[self.bucket.as_str()]);
        url.set_query(Some("list"));
        self.http
            .call("remote_object_list", &self.bucket, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => resp.json::<Vec<ObjectInfo>>().await.map_err(|e| transport_error(KIND, e)),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }
}

#[async_trait]
impl StorageBackend for RemoteObjectStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn is_available(&self) -> bool {
        self.http.is_available()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let url = self.http.url(&[self.bucket.as_str(), key]);
        let envelope = self
            .http
            .call("remote_object_get", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().get(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                match expect_found(KIND, resp, 0).await? {
                    Some(resp) => Ok(Some(
                        resp.json::<ObjectEnvelope>().await.map_err(|e| transport_error(KIND, e))?,
                    )),
                    None => Ok(None),
                }
            })
            .await?;
        envelope.map(|env| self.open(&env)).transpose()
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let envelope = self.seal(value)?;
        let size = envelope.payload.len() as u64;
        let url = self.http.url(&[self.bucket.as_str(), key]);
        self.http
            .call("remote_object_put", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().put(url.clone()).json(&envelope))
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
        let url = self.http.url(&[self.bucket.as_str(), key]);
        self.http
            .call("remote_object_delete", key, || async {
                let resp = self
                    .http
                    .authorize(self.http.client().delete(url.clone()))
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                expect_found(KIND, resp, 0).await.map(|_| ())
            })
            .await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.list_objects().await?.into_iter().map(|o| o.key).collect())
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        let used = self.list_objects().await?.iter().map(|o| o.size).sum();
        Ok(StorageQuota {
            max_size: self.max_size_bytes,
            warning_threshold: 0.9,
            used,
        })
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        let cutoff = self.platform.now_millis() - self.max_age_ms as i64;
        let stale: Vec<ObjectInfo> = self
            .list_objects()
            .await?
            .into_iter()
            .filter(|o| o.last_modified < cutoff)
            .collect();

        let mut removed = 0;
        for object in &stale {
            match self.remove(&object.key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %object.key, error = %e, "Failed to remove stale object"),
            }
        }
        if removed > 0 {
            debug!(removed, "Remote-object cleanup removed stale objects");
            crate::metrics::record_reclaimed(KIND.as_str(), removed);
        }
        Ok(removed)
    }
}
