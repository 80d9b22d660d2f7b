// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared HTTP plumbing for the remote tiers.
//!
//! Every call runs inside the retry manager, and each attempt runs inside the
//! tier's circuit breaker (retry outside, breaker inside). A rejection from
//! an open breaker is never retried, so an open circuit costs one check.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

use super::traits::{BackendKind, StorageError};
use crate::platform::Platform;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{RetryManager, RetryPolicy};

/// Map a transport-level failure (no HTTP status) to a storage error.
pub(crate) fn transport_error(kind: BackendKind, err: reqwest::Error) -> StorageError {
    if err.is_decode() {
        return StorageError::Serialization(format!("{kind}: {err}"));
    }
    if err.is_builder() {
        return StorageError::InvalidConfig(format!("{kind}: {err}"));
    }
    // connect, timeout, reset mid-body
    StorageError::TransientIo {
        backend: kind,
        message: err.to_string(),
    }
}

/// Map a non-success, non-404 HTTP status to a storage error.
pub(crate) fn status_error(kind: BackendKind, status: StatusCode, body: &str, requested: u64) -> StorageError {
    match status.as_u16() {
        413 | 507 => StorageError::CapacityExceeded {
            backend: kind,
            requested,
            limit: 0,
        },
        408 | 429 => StorageError::TransientIo {
            backend: kind,
            message: format!("{status}"),
        },
        s if s >= 500 => StorageError::TransientIo {
            backend: kind,
            message: format!("{status}: {body}"),
        },
        _ => StorageError::Backend(format!("{kind} returned {status}: {body}")),
    }
}

/// Success → `Some(resp)`, 404 → `None`, anything else → error.
pub(crate) async fn expect_found(kind: BackendKind, resp: Response, requested: u64) -> Result<Option<Response>, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(Some(resp));
    }
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(kind, status, &body, requested))
}

/// Client, base URL and resilience wrappers for one remote tier.
pub(crate) struct HttpTier {
    kind: BackendKind,
    client: Client,
    base: Url,
    auth_token: Option<String>,
    retry: RetryManager,
    circuit: Option<Arc<CircuitBreaker>>,
    platform: Arc<dyn Platform>,
}

impl HttpTier {
    pub(crate) fn new(
        kind: BackendKind,
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
        circuit: Option<Arc<CircuitBreaker>>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, StorageError> {
        let base = Url::parse(base_url)
            .map_err(|e| StorageError::InvalidConfig(format!("{kind}: bad base_url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(StorageError::InvalidConfig(format!("{kind}: '{base_url}' cannot be a base URL")));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("{kind}: {e}")))?;
        Ok(Self {
            kind,
            client,
            base,
            auth_token,
            retry: RetryManager::new(retry),
            circuit,
            platform,
        })
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.kind
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn circuit(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit.as_ref()
    }

    /// Base URL with `segments` appended, each percent-encoded as one segment.
    pub(crate) fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Online and not short-circuited.
    pub(crate) fn is_available(&self) -> bool {
        self.platform.is_online() && !self.circuit.as_ref().is_some_and(|cb| cb.is_open())
    }

    /// Run one logical remote operation with retry and circuit protection.
    pub(crate) async fn call<T, F, Fut>(&self, operation: &str, context: &str, attempt: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        if !self.platform.is_online() {
            return Err(StorageError::TransientIo {
                backend: self.kind,
                message: "platform offline".to_string(),
            });
        }
        self.retry
            .execute_with_retry(operation, context, || async {
                match &self.circuit {
                    Some(cb) => cb.execute(operation, &attempt).await,
                    None => attempt().await,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualPlatform;

    fn tier(base: &str) -> HttpTier {
        HttpTier::new(
            BackendKind::RemoteServer,
            base,
            None,
            Duration::from_secs(1),
            RetryPolicy::immediate(1),
            None,
            Arc::new(ManualPlatform::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let t = tier("http://localhost:8080/api/");
        let url = t.url(&["batches", "batch_vault:state:b 1", "state"]);
        assert_eq!(url.path(), "/api/batches/batch_vault:state:b%201/state");
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let result = HttpTier::new(
            BackendKind::RemoteObject,
            "not a url",
            None,
            Duration::from_secs(1),
            RetryPolicy::immediate(1),
            None,
            Arc::new(ManualPlatform::new(0)),
        );
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_status_mapping() {
        let kind = BackendKind::RemoteServer;
        assert!(matches!(
            status_error(kind, StatusCode::SERVICE_UNAVAILABLE, "", 0),
            StorageError::TransientIo { .. }
        ));
        assert!(matches!(
            status_error(kind, StatusCode::TOO_MANY_REQUESTS, "", 0),
            StorageError::TransientIo { .. }
        ));
        assert!(matches!(
            status_error(kind, StatusCode::PAYLOAD_TOO_LARGE, "", 10),
            StorageError::CapacityExceeded { requested: 10, .. }
        ));
        assert!(matches!(
            status_error(kind, StatusCode::INSUFFICIENT_STORAGE, "", 0),
            StorageError::CapacityExceeded { .. }
        ));
        assert!(matches!(
            status_error(kind, StatusCode::FORBIDDEN, "nope", 0),
            StorageError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let platform = Arc::new(ManualPlatform::new(0));
        platform.set_online(false);
        let t = HttpTier::new(
            BackendKind::RemoteServer,
            "http://localhost:1",
            None,
            Duration::from_secs(1),
            RetryPolicy::immediate(3),
            None,
            platform,
        )
        .unwrap();

        assert!(!t.is_available());
        let result: Result<(), _> = t.call("get", "k", || async { Ok(()) }).await;
        assert!(matches!(result, Err(StorageError::TransientIo { .. })));
    }
}
