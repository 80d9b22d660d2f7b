// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Small persistent tier: the whole key space lives in one JSON file.
//!
//! Every mutation rewrites the file via write-to-temp-then-rename, so a
//! crash leaves either the old or the new file, never a torn one. Meant for
//! a handful of small records (current batch pointers, recent states).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{payload_size, BackendKind, StorageBackend, StorageError, StorageQuota};
use crate::config::FastLocalConfig;
use crate::platform::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: Value,
    size: u64,
    updated_at: i64,
}

type EntryMap = BTreeMap<String, FileEntry>;

pub struct FastLocalStore {
    path: PathBuf,
    config: FastLocalConfig,
    entries: Mutex<EntryMap>,
    platform: Arc<dyn Platform>,
}

fn io_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::TransientIo {
        backend: BackendKind::FastLocal,
        message: err.to_string(),
    }
}

impl FastLocalStore {
    /// Open (or create) the store file.
    ///
    /// An unreadable file is moved aside to `<path>.corrupt` and the store
    /// starts empty.
    pub async fn open(config: FastLocalConfig, platform: Arc<dyn Platform>) -> Result<Self, StorageError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<EntryMap>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!(path = %path.display(), error = %e, "Fast-local file unreadable, moving aside");
                    tokio::fs::rename(&path, &aside).await.map_err(io_error)?;
                    EntryMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EntryMap::new(),
            Err(e) => return Err(io_error(e)),
        };

        info!(path = %path.display(), entries = entries.len(), "Fast-local store opened");
        Ok(Self {
            path,
            config,
            entries: Mutex::new(entries),
            platform,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &EntryMap) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(entries)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(io_error)?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    tmp.write_all(bytes).map_err(io_error)?;
    tmp.as_file().sync_all().map_err(io_error)?;
    tmp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

fn used_bytes(entries: &EntryMap) -> u64 {
    entries.values().map(|e| e.size).sum()
}

#[async_trait]
impl StorageBackend for FastLocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::FastLocal
    }

    async fn is_available(&self) -> bool {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.lock().await.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let size = payload_size(value)?;
        if size > self.config.max_item_bytes {
            return Err(StorageError::CapacityExceeded {
                backend: BackendKind::FastLocal,
                requested: size,
                limit: self.config.max_item_bytes,
            });
        }

        let mut entries = self.entries.lock().await;
        let replaced = entries.get(key).map(|e| e.size).unwrap_or(0);
        let projected = used_bytes(&entries) - replaced + size;
        if projected > self.config.max_size_bytes {
            return Err(StorageError::CapacityExceeded {
                backend: BackendKind::FastLocal,
                requested: size,
                limit: self.config.max_size_bytes.saturating_sub(used_bytes(&entries) - replaced),
            });
        }

        let previous = entries.insert(
            key.to_string(),
            FileEntry {
                value: value.clone(),
                size,
                updated_at: self.platform.now_millis(),
            },
        );
        if let Err(e) = self.persist(&entries).await {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        crate::metrics::record_bytes_written(BackendKind::FastLocal.as_str(), size);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries).await {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn quota(&self) -> Result<StorageQuota, StorageError> {
        Ok(StorageQuota {
            max_size: self.config.max_size_bytes,
            warning_threshold: self.config.warning_threshold,
            used: used_bytes(&*self.entries.lock().await),
        })
    }

    async fn cleanup(&self) -> Result<usize, StorageError> {
        let cutoff = self.platform.now_millis() - self.config.max_age_ms as i64;
        let mut entries = self.entries.lock().await;
        let before = entries.clone();
        entries.retain(|_, e| e.updated_at >= cutoff);
        let removed = before.len() - entries.len();
        if removed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.persist(&entries).await {
            *entries = before;
            return Err(e);
        }
        debug!(removed, "Fast-local cleanup removed stale entries");
        crate::metrics::record_reclaimed(BackendKind::FastLocal.as_str(), removed);
        Ok(removed)
    }
}
