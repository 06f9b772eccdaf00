//! HTTP idempotency gate: the `Idempotency-Key` behavior matrix as a
//! execute-and-cache façade over the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use wharf_store_core::{HttpIdempotencyStore, IdempotencyDecision};
use wharf_types::{Clock, WmsError};

/// A cached or freshly produced HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResponse {
    /// Response status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// Whether the response was replayed from the cache.
    pub replayed: bool,
}

/// Wraps mutating HTTP handlers with idempotency-key semantics.
///
/// New key: the handler runs and its response is cached. Duplicate with the
/// same body: the cached response is returned byte for byte. Duplicate with
/// a different body: a conflict. Keys expire after 24 hours and are then
/// treated as new.
pub struct HttpIdempotencyGate {
    store: Arc<dyn HttpIdempotencyStore>,
    clock: Arc<dyn Clock>,
    service: String,
    lock: Duration,
}

impl HttpIdempotencyGate {
    /// Build a gate scoped to `service`.
    pub fn new(
        store: Arc<dyn HttpIdempotencyStore>,
        clock: Arc<dyn Clock>,
        service: impl Into<String>,
        lock: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            service: service.into(),
            lock,
        }
    }

    /// Digest a request body into the stored fingerprint.
    pub fn fingerprint(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    /// Run `handler` under the key, or replay the cached response.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        user_id: Option<&str>,
        body: &[u8],
        handler: F,
    ) -> Result<GateResponse, WmsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(u16, Vec<u8>), WmsError>>,
    {
        let fingerprint = Self::fingerprint(body);
        let decision = self
            .store
            .begin(
                &self.service,
                key,
                user_id,
                &fingerprint,
                self.lock,
                self.clock.now(),
            )
            .await
            .map_err(|e| WmsError::unavailable("idempotency store unavailable").with_source(e))?;

        match decision {
            IdempotencyDecision::Replay { status, body } => {
                debug!(key, "replaying cached response");
                Ok(GateResponse {
                    status,
                    body,
                    replayed: true,
                })
            }
            IdempotencyDecision::FingerprintMismatch => Err(WmsError::conflict(
                "idempotency key reused with a different request body",
            )
            .with_detail("key", key)),
            IdempotencyDecision::InFlight => Err(WmsError::conflict(
                "request with this idempotency key is still executing",
            )
            .with_detail("key", key)
            .with_detail("retry", "later")),
            IdempotencyDecision::Fresh => match handler().await {
                Ok((status, body)) => {
                    self.store
                        .complete(
                            &self.service,
                            key,
                            user_id,
                            status,
                            body.clone(),
                            self.clock.now(),
                        )
                        .await
                        .map_err(|e| {
                            WmsError::unavailable("idempotency store unavailable").with_source(e)
                        })?;
                    Ok(GateResponse {
                        status,
                        body,
                        replayed: false,
                    })
                }
                Err(err) => {
                    // Release the lock so the client's retry can run.
                    let _ = self.store.abandon(&self.service, key, user_id).await;
                    Err(err)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wharf_store_memory::MemoryStore;
    use wharf_types::SystemClock;

    fn gate(store: &MemoryStore) -> HttpIdempotencyGate {
        HttpIdempotencyGate::new(
            Arc::new(store.clone()),
            Arc::new(SystemClock),
            "order-service",
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn duplicate_request_replays_identical_bytes() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let calls = AtomicU32::new(0);
        let body = br#"{"orderId":"ORD-1"}"#;

        let first = gate
            .execute("key-1", Some("u1"), body, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok((201, b"created ORD-1".to_vec())) }
            })
            .await
            .unwrap();
        assert!(!first.replayed);

        let second = gate
            .execute("key-1", Some("u1"), body, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok((500, b"should not run".to_vec())) }
            })
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.status, first.status);
        assert_eq!(second.body, first.body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_body_under_same_key_conflicts() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        gate.execute("key-1", None, b"body-a", || async {
            Ok((200, vec![]))
        })
        .await
        .unwrap();

        let err = gate
            .execute("key-1", None, b"body-b", || async { Ok((200, vec![])) })
            .await
            .unwrap_err();
        assert_eq!(err.code, wharf_types::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn handler_failure_releases_the_key() {
        let store = MemoryStore::new();
        let gate = gate(&store);

        let err = gate
            .execute("key-1", None, b"body", || async {
                Err(WmsError::validation("bad payload"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, wharf_types::ErrorCode::ValidationError);

        // The retry executes instead of replaying a phantom cache entry.
        let retry = gate
            .execute("key-1", None, b"body", || async {
                Ok((201, b"ok".to_vec()))
            })
            .await
            .unwrap();
        assert!(!retry.replayed);
        assert_eq!(retry.status, 201);
    }

    #[test]
    fn fingerprint_is_stable_and_body_sensitive() {
        assert_eq!(
            HttpIdempotencyGate::fingerprint(b"abc"),
            HttpIdempotencyGate::fingerprint(b"abc")
        );
        assert_ne!(
            HttpIdempotencyGate::fingerprint(b"abc"),
            HttpIdempotencyGate::fingerprint(b"abd")
        );
    }
}
