//! # Batch Vault
//!
//! Tiered, failure-tolerant persistence and recovery for long-running
//! upload batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         BatchVault                          │
//! │  • persist_state() to every durable recovery source         │
//! │  • recover() / recover_components()                         │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │        UnifiedStorage        │  │   RecoveryOrchestrator   │
//! │  • size/type routing rules   │◄─│  • sources in order      │
//! │  • health-ordered reads      │  │  • conflict resolution   │
//! │  • ephemeral promotion       │  │  • dedup, cancel, timeout│
//! └──────────────────────────────┘  └──────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Ephemeral │ FastLocal │ BulkLocal │ RemoteServer │ RemoteObject │
//! │  (LRU)    │  (file)   │ (SQLite)  │ retry+breaker│ retry+breaker│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_vault::{BatchState, BatchVault, RecoveryOptions, StorageConfig, SystemPlatform};
//! use batch_vault::config::FastLocalConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), batch_vault::StorageError> {
//!     let config = StorageConfig {
//!         fast_local: Some(FastLocalConfig::at("/var/lib/uploader/state")),
//!         ..Default::default()
//!     };
//!     let vault = BatchVault::open(config, Arc::new(SystemPlatform::new())).await?;
//!
//!     let state = BatchState::new("batch-42", "session-7", 1_700_000_000_000);
//!     vault.persist_state(&state).await?;
//!
//!     let recovered = vault.recover("batch-42", RecoveryOptions::default()).await;
//!     println!("{}: {:?}", recovered.status, recovered.restored_state);
//!
//!     vault.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Tier Routing**: size and data-type rules pick the tier, with fallback
//! - **Health Tracking**: background probes plus per-operation error rates
//! - **Circuit Breakers**: per remote tier, open circuits fail fast
//! - **Retry Logic**: exponential backoff with jitter for transient failures
//! - **Recovery**: multi-source state reconstruction with field-level merging
//! - **Integrity**: versioned, checksummed records; divergence is flagged
//! - **Compression / Encryption**: optional for remote object payloads
//!
//! ## Configuration
//!
//! See [`StorageConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`vault`]: The [`BatchVault`] facade
//! - [`router`]: [`UnifiedStorage`], routing rules and the health table
//! - [`recovery`]: [`RecoveryOrchestrator`] and conflict resolution
//! - [`storage`]: The five tiers and the backend trait
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`batch_state`]: Batch state and its persisted record format

pub mod config;
pub mod platform;
pub mod batch_state;
pub mod storage;
pub mod resilience;
pub mod router;
pub mod recovery;
pub mod vault;
pub mod metrics;
pub mod compression;
pub mod encryption;

pub use config::StorageConfig;
pub use platform::{ManualPlatform, Platform, SystemPlatform};
pub use batch_state::{BatchComponent, BatchState, BatchStatus, PartialBatchState, PersistedRecord};
pub use storage::traits::{BackendKind, ErrorKind, StorageBackend, StorageError, StorageQuota};
pub use resilience::circuit_breaker::{BackendCircuits, CircuitBreaker, CircuitConfig, CircuitState};
pub use resilience::retry::{RetryManager, RetryPolicy};
pub use router::{SaveOptions, StorageHealth, StorageMetrics, UnifiedStorage};
pub use recovery::{ConflictResolution, RecoveryOptions, RecoveryOrchestrator, RecoveryResult, RecoveryStatus};
pub use vault::{BatchVault, PersistReport};
pub use metrics::LatencyTimer;
