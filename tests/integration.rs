//! Integration Tests for Batch Vault
//!
//! Remote tiers are exercised against in-process `axum` servers that mimic
//! the application server and the object store, so no external services are
//! needed. Local tiers use temp directories and in-memory SQLite.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run only failure scenario tests
//! cargo test --test integration failure
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation against each remote tier
//! - `failure_*` - Retries, exhausted budgets, open circuits
//! - `e2e_*` - Persist and recover through a fully configured vault

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use batch_vault::batch_state::state_key;
use batch_vault::config::{BulkLocalConfig, FastLocalConfig, RemoteObjectConfig, RemoteServerConfig};
use batch_vault::encryption::PayloadCipher;
use batch_vault::storage::remote_object::RemoteObjectStore;
use batch_vault::storage::remote_server::{RemoteBatchStatus, RemoteServerStore};
use batch_vault::{
    BackendKind, BatchComponent, BatchState, BatchStatus, BatchVault, CircuitBreaker, CircuitConfig, CircuitState,
    ManualPlatform, PersistedRecord, RecoveryOptions, RecoveryStatus, RetryPolicy, StorageBackend, StorageConfig,
    StorageError,
};

// =============================================================================
// Mock Servers
// =============================================================================

#[derive(Default)]
struct MockServer {
    states: Mutex<HashMap<String, Value>>,
    statuses: Mutex<HashMap<String, Value>>,
    objects: Mutex<HashMap<String, Value>>,
    /// Answer this many upcoming requests with 503
    fail_remaining: AtomicU32,
    requests: AtomicU32,
    last_auth: Mutex<Option<String>>,
}

type Mock = Arc<MockServer>;

impl MockServer {
    fn hit(&self, headers: &HeaderMap) -> Option<Response> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_auth.lock() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        failing.then(|| (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response())
    }

    fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

fn found(value: Option<Value>) -> Response {
    match value {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_state(State(mock): State<Mock>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let value = mock.states.lock().get(&key).cloned();
    found(value)
}

async fn put_state(State(mock): State<Mock>, headers: HeaderMap, Path(key): Path<String>, Json(body): Json<Value>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    mock.states.lock().insert(key, body);
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_state(State(mock): State<Mock>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    match mock.states.lock().remove(&key) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_states(State(mock): State<Mock>, headers: HeaderMap) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let keys: Vec<String> = mock.states.lock().keys().cloned().collect();
    Json(keys).into_response()
}

async fn quota(State(mock): State<Mock>, headers: HeaderMap) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let used: usize = mock.states.lock().values().map(|v| v.to_string().len()).sum();
    Json(json!({"max_size": 1_000_000, "warning_threshold": 0.8, "used": used})).into_response()
}

async fn cleanup(State(mock): State<Mock>, headers: HeaderMap) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    Json(json!({"removed": 0})).into_response()
}

async fn batch_status(State(mock): State<Mock>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let value = mock.statuses.lock().get(&key).cloned();
    found(value)
}

async fn list_objects(State(mock): State<Mock>, headers: HeaderMap, Path(_bucket): Path<String>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let listing: Vec<Value> = mock
        .objects
        .lock()
        .iter()
        .map(|(key, envelope)| {
            json!({
                "key": key,
                "size": envelope["payload"].as_str().map_or(0, str::len),
                "last_modified": envelope["stored_at"],
            })
        })
        .collect();
    Json(listing).into_response()
}

async fn get_object(State(mock): State<Mock>, headers: HeaderMap, Path((_bucket, key)): Path<(String, String)>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    let value = mock.objects.lock().get(&key).cloned();
    found(value)
}

async fn put_object(
    State(mock): State<Mock>,
    headers: HeaderMap,
    Path((_bucket, key)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    mock.objects.lock().insert(key, body);
    StatusCode::OK.into_response()
}

async fn delete_object(State(mock): State<Mock>, headers: HeaderMap, Path((_bucket, key)): Path<(String, String)>) -> Response {
    if let Some(resp) = mock.hit(&headers) {
        return resp;
    }
    mock.objects.lock().remove(&key);
    StatusCode::NO_CONTENT.into_response()
}

/// Serve `mock` on an ephemeral port; returns the base URL.
async fn spawn_mock(mock: Mock) -> String {
    let app = Router::new()
        .route("/batches/states", get(list_states))
        .route("/batches/quota", get(quota))
        .route("/batches/cleanup", post(cleanup))
        .route("/batches/:key/state", get(get_state).post(put_state).delete(delete_state))
        .route("/batches/:key/status", get(batch_status))
        .route("/objects/:bucket", get(list_objects))
        .route("/objects/:bucket/:key", get(get_object).put(put_object).delete(delete_object))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// =============================================================================
// Helpers
// =============================================================================

/// Route vault logs to the test harness; `RUST_LOG=batch_vault=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn platform() -> Arc<ManualPlatform> {
    Arc::new(ManualPlatform::new(1_700_000_000_000))
}

fn server_store(base_url: &str, retry: RetryPolicy, circuit: Option<Arc<CircuitBreaker>>) -> RemoteServerStore {
    let config = RemoteServerConfig {
        base_url: base_url.to_string(),
        auth_token: Some("t0k3n".into()),
        ..Default::default()
    };
    RemoteServerStore::new(&config, retry, circuit, platform()).unwrap()
}

fn sealed<T: serde::Serialize + serde::de::DeserializeOwned>(state: T, batch_id: &str, session_id: &str) -> Value {
    PersistedRecord::seal(state, batch_id, session_id, None, 1_700_000_000_000)
        .unwrap()
        .to_value()
        .unwrap()
}

fn ready_state(batch_id: &str, session_id: &str, resume_count: u32) -> BatchState {
    BatchState {
        status: BatchStatus::Ready,
        resume_count,
        ..BatchState::new(batch_id, session_id, 1_700_000_000_000)
    }
}

// =============================================================================
// Happy Path Tests - Remote Tiers
// =============================================================================

#[tokio::test]
async fn happy_remote_server_round_trip() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let store = server_store(&base, RetryPolicy::immediate(3), None);

    assert_eq!(store.get("batch_vault:state:b1").await.unwrap(), None);

    store.set("batch_vault:state:b1", &json!({"n": 1})).await.unwrap();
    assert_eq!(store.get("batch_vault:state:b1").await.unwrap(), Some(json!({"n": 1})));
    assert_eq!(store.list().await.unwrap(), vec!["batch_vault:state:b1".to_string()]);
    assert_eq!(mock.last_auth.lock().as_deref(), Some("Bearer t0k3n"));

    let quota = store.quota().await.unwrap();
    assert_eq!(quota.max_size, 1_000_000);
    assert!(quota.used > 0);

    store.remove("batch_vault:state:b1").await.unwrap();
    // Already gone is not an error
    store.remove("batch_vault:state:b1").await.unwrap();
    assert_eq!(store.cleanup().await.unwrap(), 0);
}

#[tokio::test]
async fn happy_remote_server_batch_status() {
    let mock = Mock::default();
    mock.statuses
        .lock()
        .insert("b1".into(), json!({"exists": true, "resume_count": 4, "claimable": true}));
    let base = spawn_mock(mock.clone()).await;
    let store = server_store(&base, RetryPolicy::immediate(1), None);

    let status = store.batch_status("b1").await.unwrap();
    assert_eq!(
        status,
        Some(RemoteBatchStatus {
            exists: true,
            resume_count: 4,
            claimable: true
        })
    );
    assert_eq!(store.batch_status("unknown").await.unwrap(), None);
}

#[tokio::test]
async fn happy_remote_object_envelope() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let config = RemoteObjectConfig {
        base_url: format!("{base}/objects"),
        compress: true,
        encryption_key_hex: Some(PayloadCipher::generate_key_hex()),
        ..Default::default()
    };
    let store = RemoteObjectStore::new(&config, RetryPolicy::immediate(2), None, platform()).unwrap();

    let value = json!({"resumes": vec!["candidate-resume.pdf"; 100]});
    store.set("big", &value).await.unwrap();

    let raw = mock.objects.lock().get("big").cloned().unwrap();
    assert_eq!(raw["encrypted"], json!(true));
    assert_eq!(raw["compressed"], json!(cfg!(feature = "compression")));
    assert!(!raw["payload"].as_str().unwrap().contains("candidate"));

    assert_eq!(store.get("big").await.unwrap(), Some(value));
    assert_eq!(store.get("missing").await.unwrap(), None);

    let objects = store.list_objects().await.unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].key, "big");
    assert_eq!(store.quota().await.unwrap().used, objects[0].size);
}

#[tokio::test]
async fn happy_remote_object_cleanup_removes_stale() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let clock = platform();
    let config = RemoteObjectConfig {
        base_url: format!("{base}/objects"),
        compress: false,
        max_age_ms: 1_000,
        ..Default::default()
    };
    let store = RemoteObjectStore::new(&config, RetryPolicy::immediate(1), None, clock.clone()).unwrap();

    store.set("old", &json!(1)).await.unwrap();
    clock.advance_millis(5_000);
    store.set("new", &json!(2)).await.unwrap();

    assert_eq!(store.cleanup().await.unwrap(), 1);
    assert_eq!(store.list().await.unwrap(), vec!["new".to_string()]);
}

// =============================================================================
// Failure Scenario Tests - Retry & Circuit Breaking
// =============================================================================

#[tokio::test]
async fn failure_transient_errors_are_retried() {
    let mock = Mock::default();
    mock.states.lock().insert("k".into(), json!("v"));
    let base = spawn_mock(mock.clone()).await;
    let store = server_store(&base, RetryPolicy::immediate(3), None);

    mock.fail_next(2);
    assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
    assert_eq!(mock.requests(), 3);
}

#[tokio::test]
async fn failure_retry_budget_exhausted() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let store = server_store(&base, RetryPolicy::immediate(3), None);

    mock.fail_next(10);
    let err = store.get("k").await.unwrap_err();
    match err {
        StorageError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, StorageError::TransientIo { .. }));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(mock.requests(), 3);
}

#[tokio::test]
async fn failure_circuit_opens_and_fails_fast() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let circuit = Arc::new(CircuitBreaker::new(
        "remote-server",
        CircuitConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
        },
    ));
    let store = server_store(&base, RetryPolicy::immediate(1), Some(circuit.clone()));

    mock.fail_next(100);
    assert!(store.get("k").await.is_err());
    assert!(store.get("k").await.is_err());
    assert_eq!(circuit.state(), CircuitState::Open);
    assert!(!store.is_available().await);

    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, StorageError::CircuitOpen { .. }));
    // The rejected call never reached the server
    assert_eq!(mock.requests(), 2);
    assert_eq!(circuit.snapshot().rejected_requests, 1);
}

#[tokio::test]
async fn failure_open_circuit_is_not_retried() {
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;
    let circuit = Arc::new(CircuitBreaker::new(
        "remote-server",
        CircuitConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
        },
    ));
    let store = server_store(&base, RetryPolicy::immediate(5), Some(circuit.clone()));

    mock.fail_next(100);
    // First attempt trips the breaker, the second is rejected and ends the loop
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, StorageError::CircuitOpen { .. }));
    assert_eq!(mock.requests(), 1);
}

// =============================================================================
// End-to-End Tests - Persist & Recover
// =============================================================================

#[tokio::test]
async fn e2e_bulk_local_only_recovery() {
    init_tracing();
    let config = StorageConfig {
        bulk_local: Some(BulkLocalConfig::default()),
        ..Default::default()
    };
    let vault = BatchVault::open(config, platform()).await.unwrap();

    let report = vault.persist_state(&ready_state("b1", "s1", 2)).await.unwrap();
    assert_eq!(report.written, vec![BackendKind::BulkLocal]);

    let result = vault.recover("b1", RecoveryOptions::default()).await;
    assert_eq!(result.status, RecoveryStatus::Success);
    assert_eq!(result.metadata.source, Some(BackendKind::BulkLocal));
    assert_eq!(result.restored_state.unwrap().resume_count, 2);

    vault.shutdown().await;
}

#[tokio::test]
async fn e2e_partial_local_state_merged_with_remote() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mock = Mock::default();
    mock.states
        .lock()
        .insert(state_key("b1"), sealed(ready_state("b1", "s1", 5), "b1", "s1"));
    let base = spawn_mock(mock.clone()).await;

    let config = StorageConfig {
        fast_local: Some(FastLocalConfig::at(dir.path().join("fast.json"))),
        remote_server: Some(RemoteServerConfig {
            base_url: base,
            ..Default::default()
        }),
        ..Default::default()
    };
    let vault = BatchVault::open(config, platform()).await.unwrap();

    // Local copy: older, mid-validation, session lost
    let partial = json!({"batch_id": "b1", "resume_count": 3, "status": "validating"});
    vault
        .storage()
        .save_to(BackendKind::FastLocal, &state_key("b1"), &sealed(partial, "b1", ""))
        .await
        .unwrap();

    let result = vault.recover("b1", RecoveryOptions::default()).await;
    assert_eq!(result.status, RecoveryStatus::Success);
    assert_eq!(result.recovered_items, vec![BackendKind::FastLocal, BackendKind::RemoteServer]);
    assert_eq!(result.warnings.len(), 2);

    let state = result.restored_state.unwrap();
    assert_eq!(state.resume_count, 5);
    assert_eq!(state.status, BatchStatus::Ready);
    assert_eq!(state.session_id, "s1");

    vault.shutdown().await;
}

#[tokio::test]
async fn e2e_state_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = || StorageConfig {
        fast_local: Some(FastLocalConfig::at(dir.path().join("fast.json"))),
        ..Default::default()
    };

    let vault = BatchVault::open(config(), platform()).await.unwrap();
    vault.persist_state(&ready_state("b1", "s1", 1)).await.unwrap();
    vault.shutdown().await;

    let reopened = BatchVault::open(config(), platform()).await.unwrap();
    let result = reopened.recover("b1", RecoveryOptions::default()).await;
    assert_eq!(result.status, RecoveryStatus::Success);
    assert_eq!(result.metadata.source, Some(BackendKind::FastLocal));
    reopened.shutdown().await;
}

#[tokio::test]
async fn e2e_metadata_from_server_status() {
    init_tracing();
    let mock = Mock::default();
    mock.statuses
        .lock()
        .insert("b1".into(), json!({"exists": true, "resume_count": 4, "claimable": false}));
    let base = spawn_mock(mock.clone()).await;

    let config = StorageConfig {
        remote_server: Some(RemoteServerConfig {
            base_url: base,
            ..Default::default()
        }),
        ..Default::default()
    };
    let vault = BatchVault::open(config, platform()).await.unwrap();

    let result = vault
        .recover_components("b1", &[BatchComponent::Metadata, BatchComponent::Resumes])
        .await;
    let metadata = result.get(BatchComponent::Metadata).unwrap();
    assert_eq!(metadata.source, Some(BackendKind::RemoteServer));
    assert_eq!(
        metadata.value,
        Some(json!({"exists": true, "resume_count": 4, "claimable": false}))
    );
    assert_eq!(result.recovered(), vec![BatchComponent::Metadata]);

    vault.shutdown().await;
}

#[tokio::test]
async fn e2e_write_back_repairs_remote() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mock = Mock::default();
    let base = spawn_mock(mock.clone()).await;

    let config = StorageConfig {
        fast_local: Some(FastLocalConfig::at(dir.path().join("fast.json"))),
        remote_server: Some(RemoteServerConfig {
            base_url: base,
            ..Default::default()
        }),
        ..Default::default()
    };
    let vault = BatchVault::open(config, platform()).await.unwrap();
    vault
        .storage()
        .save_to(
            BackendKind::FastLocal,
            &state_key("b1"),
            &sealed(ready_state("b1", "s1", 3), "b1", "s1"),
        )
        .await
        .unwrap();

    let options = RecoveryOptions {
        preferred_source: Some(BackendKind::RemoteServer),
        write_back: true,
        ..Default::default()
    };
    let result = vault.recover("b1", options).await;
    assert_eq!(result.status, RecoveryStatus::Success);
    assert_eq!(result.metadata.sources_tried, vec![BackendKind::RemoteServer, BackendKind::FastLocal]);

    let repaired = mock.states.lock().get(&state_key("b1")).cloned().unwrap();
    let record = PersistedRecord::<BatchState>::open(repaired).unwrap();
    assert_eq!(record.state.resume_count, 3);

    vault.shutdown().await;
}
