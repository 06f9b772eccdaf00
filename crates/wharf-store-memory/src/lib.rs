#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-store-memory** – In-memory storage driver for Wharf.
//!
//! This crate provides a fast, non-persistent implementation of every store
//! trait in `wharf-store-core`. All state lives behind a single lock, which
//! is what makes `save` atomic the same way the SQLite driver's transaction
//! is. Suitable for tests, development, and single-process deployments that
//! can tolerate data loss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use wharf_events::AggregateType;
use wharf_store_core::{
    AggregateDoc, AggregateStore, ConsumerDedupStore, DedupRecord, DedupStatus,
    HttpIdempotencyRecord, HttpIdempotencyState, HttpIdempotencyStore, IdempotencyDecision,
    OffsetStore, OutboxRow, OutboxStore, Reservation, StoreError, DEFAULT_DEDUP_TTL,
    HTTP_IDEMPOTENCY_RETENTION, MAX_IDEMPOTENCY_KEY_LEN,
};

type AggregateKey = (AggregateType, String);
type DedupKey = (String, Uuid);
type HttpKey = (String, String, Option<String>);
type OffsetKey = (String, String);

#[derive(Default)]
struct Inner {
    aggregates: HashMap<AggregateKey, AggregateDoc>,
    outbox: Vec<OutboxRow>,
    dedup: HashMap<DedupKey, DedupRecord>,
    http: HashMap<HttpKey, HttpIdempotencyRecord>,
    offsets: HashMap<OffsetKey, u64>,
}

/// In-memory store implementing every `wharf-store-core` trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    dedup_ttl: Duration,
}

impl MemoryStore {
    /// Create an empty store with the default dedup TTL.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }

    /// Override the dedup record TTL.
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Snapshot of every outbox row, for tests and inspection.
    pub async fn outbox_rows(&self) -> Vec<OutboxRow> {
        self.inner.read().await.outbox.clone()
    }

    /// Number of stored aggregates, for tests.
    pub async fn aggregate_count(&self) -> usize {
        self.inner.read().await.aggregates.len()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn load(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: &str,
    ) -> Result<Option<AggregateDoc>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .aggregates
            .get(&(aggregate_type, aggregate_id.to_owned()))
            .cloned())
    }

    async fn save(&self, doc: AggregateDoc, outbox: Vec<OutboxRow>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (doc.aggregate_type, doc.aggregate_id.clone());
        let stored_version = inner.aggregates.get(&key).map(|d| d.version).unwrap_or(0);
        if stored_version != doc.version.saturating_sub(1) {
            return Err(StoreError::VersionConflict {
                aggregate_id: doc.aggregate_id,
                expected: doc.version.saturating_sub(1),
                actual: stored_version,
            });
        }
        // Single write-lock scope: the upsert and the outbox inserts commit
        // together or not at all.
        inner.aggregates.insert(key, doc);
        inner.outbox.extend(outbox);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut order: Vec<usize> = (0..inner.outbox.len()).collect();
        order.sort_by_key(|&i| inner.outbox[i].created_at);

        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut claimed: Vec<OutboxRow> = Vec::new();
        for i in order {
            if claimed.len() >= limit {
                break;
            }
            let row = &inner.outbox[i];
            if !row.is_claimable(now) {
                continue;
            }
            // An older unpublished row for the same aggregate that is not part
            // of this claim (leased elsewhere or parked) must publish first;
            // skipping here preserves per-aggregate order.
            let blocked = inner.outbox.iter().any(|other| {
                other.aggregate_id == row.aggregate_id
                    && !other.is_published()
                    && other.created_at < row.created_at
                    && !other.is_claimable(now)
                    && !claimed.iter().any(|c| c.id == other.id)
            });
            if blocked {
                continue;
            }
            let row = &mut inner.outbox[i];
            row.claimed_until = Some(lease_until);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox row {id}")))?;
        row.published_at = Some(now);
        row.claimed_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox row {id}")))?;
        row.attempts += 1;
        row.last_error = Some(error.to_owned());
        row.claimed_until = None;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|r| !r.is_published() && !r.is_dead_lettered())
            .count() as u64)
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|r| r.is_dead_lettered())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConsumerDedupStore for MemoryStore {
    async fn reserve(
        &self,
        group: &str,
        event_id: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (group.to_owned(), event_id);
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let expires_at = now
            + chrono::Duration::from_std(self.dedup_ttl)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

        match inner.dedup.get_mut(&key) {
            None => {
                inner.dedup.insert(
                    key,
                    DedupRecord {
                        consumer_group: group.to_owned(),
                        event_id,
                        first_seen_at: now,
                        status: DedupStatus::InProgress,
                        attempts: 0,
                        lease_until: Some(lease_until),
                        expires_at,
                    },
                );
                Ok(Reservation::Acquired)
            }
            Some(record) if record.expires_at <= now => {
                // TTL lapsed: the upstream retention is gone too, treat as new.
                record.first_seen_at = now;
                record.status = DedupStatus::InProgress;
                record.attempts = 0;
                record.lease_until = Some(lease_until);
                record.expires_at = expires_at;
                Ok(Reservation::Acquired)
            }
            Some(record) => match record.status {
                DedupStatus::Succeeded => Ok(Reservation::AlreadySucceeded),
                DedupStatus::InProgress => {
                    if record.lease_until.map(|l| l > now).unwrap_or(false) {
                        Ok(Reservation::InFlight)
                    } else {
                        record.lease_until = Some(lease_until);
                        Ok(Reservation::Acquired)
                    }
                }
                DedupStatus::Failed => {
                    record.status = DedupStatus::InProgress;
                    record.lease_until = Some(lease_until);
                    Ok(Reservation::Acquired)
                }
            },
        }
    }

    async fn mark_succeeded(
        &self,
        group: &str,
        event_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .dedup
            .get_mut(&(group.to_owned(), event_id))
            .ok_or_else(|| StoreError::NotFound(format!("dedup record {group}/{event_id}")))?;
        record.status = DedupStatus::Succeeded;
        record.lease_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        group: &str,
        event_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .dedup
            .get_mut(&(group.to_owned(), event_id))
            .ok_or_else(|| StoreError::NotFound(format!("dedup record {group}/{event_id}")))?;
        record.status = DedupStatus::Failed;
        record.attempts += 1;
        record.lease_until = None;
        Ok(record.attempts)
    }

    async fn status(
        &self,
        group: &str,
        event_id: Uuid,
    ) -> Result<Option<DedupRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.dedup.get(&(group.to_owned(), event_id)).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.dedup.len();
        inner.dedup.retain(|_, r| r.expires_at > now);
        Ok((before - inner.dedup.len()) as u64)
    }
}

#[async_trait]
impl HttpIdempotencyStore for MemoryStore {
    async fn begin(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
        fingerprint: &str,
        lock: Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyDecision, StoreError> {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(StoreError::InvalidKey(format!(
                "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        let mut inner = self.inner.write().await;
        let map_key = (service.to_owned(), key.to_owned(), user_id.map(str::to_owned));
        let lock_expires_at = now
            + chrono::Duration::from_std(lock)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let retention = chrono::Duration::from_std(HTTP_IDEMPOTENCY_RETENTION)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let fresh = HttpIdempotencyRecord {
            service: service.to_owned(),
            key: key.to_owned(),
            user_id: user_id.map(str::to_owned),
            request_fingerprint: fingerprint.to_owned(),
            response_status: None,
            response_body: None,
            state: HttpIdempotencyState::InFlight,
            lock_expires_at,
            created_at: now,
        };

        match inner.http.get(&map_key) {
            None => {
                inner.http.insert(map_key, fresh);
                Ok(IdempotencyDecision::Fresh)
            }
            Some(record) if record.created_at + retention <= now => {
                inner.http.insert(map_key, fresh);
                Ok(IdempotencyDecision::Fresh)
            }
            Some(record) if record.request_fingerprint != fingerprint => {
                Ok(IdempotencyDecision::FingerprintMismatch)
            }
            Some(record) => match record.state {
                HttpIdempotencyState::Done => Ok(IdempotencyDecision::Replay {
                    status: record.response_status.unwrap_or(200),
                    body: record.response_body.clone().unwrap_or_default(),
                }),
                HttpIdempotencyState::InFlight if record.lock_expires_at <= now => {
                    inner.http.insert(map_key, fresh);
                    Ok(IdempotencyDecision::Fresh)
                }
                HttpIdempotencyState::InFlight => Ok(IdempotencyDecision::InFlight),
            },
        }
    }

    async fn complete(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
        status: u16,
        body: Vec<u8>,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let map_key = (service.to_owned(), key.to_owned(), user_id.map(str::to_owned));
        let record = inner
            .http
            .get_mut(&map_key)
            .ok_or_else(|| StoreError::NotFound(format!("idempotency key {key}")))?;
        record.response_status = Some(status);
        record.response_body = Some(body);
        record.state = HttpIdempotencyState::Done;
        Ok(())
    }

    async fn abandon(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let map_key = (service.to_owned(), key.to_owned(), user_id.map(str::to_owned));
        inner.http.remove(&map_key);
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for MemoryStore {
    async fn committed(&self, group: &str, topic: &str) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .offsets
            .get(&(group.to_owned(), topic.to_owned()))
            .copied())
    }

    async fn commit(&self, group: &str, topic: &str, offset: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .offsets
            .insert((group.to_owned(), topic.to_owned()), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, version: u64) -> AggregateDoc {
        AggregateDoc {
            aggregate_id: id.to_owned(),
            aggregate_type: AggregateType::Order,
            version,
            state: serde_json::json!({"status": "received"}),
            updated_at: Utc::now(),
        }
    }

    fn outbox_row(aggregate_id: &str, created_at: DateTime<Utc>) -> OutboxRow {
        OutboxRow::new(
            Uuid::new_v4(),
            aggregate_id.to_owned(),
            AggregateType::Order,
            "wms.orders.events".to_owned(),
            "order.received".to_owned(),
            b"{}".to_vec(),
            created_at,
        )
    }

    #[tokio::test]
    async fn save_is_atomic_and_version_checked() {
        let store = MemoryStore::new();
        let row = outbox_row("ORD-1", Utc::now());
        store.save(doc("ORD-1", 1), vec![row]).await.unwrap();

        assert_eq!(store.aggregate_count().await, 1);
        assert_eq!(store.outbox_rows().await.len(), 1);

        // Stale write: nothing lands.
        let err = store
            .save(doc("ORD-1", 1), vec![outbox_row("ORD-1", Utc::now())])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert_eq!(store.outbox_rows().await.len(), 1);

        // Correct next version succeeds.
        store.save(doc("ORD-1", 2), vec![]).await.unwrap();
        let loaded = store
            .load(AggregateType::Order, "ORD-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn claim_respects_lease_and_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let older = outbox_row("ORD-1", now - chrono::Duration::seconds(10));
        let newer = outbox_row("ORD-2", now - chrono::Duration::seconds(5));
        store.save(doc("ORD-1", 1), vec![older.clone()]).await.unwrap();
        store.save(doc("ORD-2", 1), vec![newer.clone()]).await.unwrap();

        let batch = store
            .claim_batch(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, older.id);

        // Everything is leased; a second claimant gets nothing.
        let empty = store
            .claim_batch(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert!(empty.is_empty());

        // After the lease lapses the rows are claimable again.
        let later = now + chrono::Duration::seconds(60);
        let reclaimed = store
            .claim_batch(10, Duration::from_secs(30), later)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 2);
    }

    #[tokio::test]
    async fn failed_rows_retry_until_parked() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let row = outbox_row("ORD-1", now);
        let id = row.id;
        store.save(doc("ORD-1", 1), vec![row]).await.unwrap();

        for _ in 0..wharf_store_core::DEFAULT_MAX_ATTEMPTS {
            let batch = store
                .claim_batch(1, Duration::from_secs(0), now)
                .await
                .unwrap();
            assert_eq!(batch.len(), 1);
            wharf_store_core::OutboxStore::mark_failed(&store, id, "bus down", now)
                .await
                .unwrap();
        }

        let batch = store.claim_batch(1, Duration::from_secs(0), now).await.unwrap();
        assert!(batch.is_empty());
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("bus down"));
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dedup_reserve_protocol() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event_id = Uuid::new_v4();
        let lease = Duration::from_secs(30);

        assert_eq!(
            store.reserve("g", event_id, lease, now).await.unwrap(),
            Reservation::Acquired
        );
        // Unexpired lease: another worker backs off.
        assert_eq!(
            store.reserve("g", event_id, lease, now).await.unwrap(),
            Reservation::InFlight
        );
        // Expired lease: re-claimed.
        let later = now + chrono::Duration::seconds(60);
        assert_eq!(
            store.reserve("g", event_id, lease, later).await.unwrap(),
            Reservation::Acquired
        );

        store.mark_succeeded("g", event_id, later).await.unwrap();
        assert_eq!(
            store.reserve("g", event_id, lease, later).await.unwrap(),
            Reservation::AlreadySucceeded
        );

        // A different group is independent.
        assert_eq!(
            store.reserve("h", event_id, lease, later).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn dedup_failures_count_and_reclaim() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event_id = Uuid::new_v4();
        let lease = Duration::from_secs(30);

        store.reserve("g", event_id, lease, now).await.unwrap();
        assert_eq!(
            wharf_store_core::ConsumerDedupStore::mark_failed(&store, "g", event_id, now)
                .await
                .unwrap(),
            1
        );
        // Failed records re-claim immediately.
        assert_eq!(
            store.reserve("g", event_id, lease, now).await.unwrap(),
            Reservation::Acquired
        );
        assert_eq!(
            wharf_store_core::ConsumerDedupStore::mark_failed(&store, "g", event_id, now)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn dedup_ttl_purges() {
        let store = MemoryStore::new().with_dedup_ttl(Duration::from_secs(1));
        let now = Utc::now();
        let event_id = Uuid::new_v4();
        store
            .reserve("g", event_id, Duration::from_secs(1), now)
            .await
            .unwrap();
        store.mark_succeeded("g", event_id, now).await.unwrap();

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(store.purge_expired(later).await.unwrap(), 1);
        assert!(store.status("g", event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_idempotency_matrix() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let lock = Duration::from_secs(30);

        // New key: execute.
        assert_eq!(
            store
                .begin("orders", "key-1", Some("u1"), "fp-a", lock, now)
                .await
                .unwrap(),
            IdempotencyDecision::Fresh
        );
        // Same key while executing: in flight.
        assert_eq!(
            store
                .begin("orders", "key-1", Some("u1"), "fp-a", lock, now)
                .await
                .unwrap(),
            IdempotencyDecision::InFlight
        );
        store
            .complete("orders", "key-1", Some("u1"), 201, b"created".to_vec(), now)
            .await
            .unwrap();
        // Duplicate with same body: replay cached response.
        match store
            .begin("orders", "key-1", Some("u1"), "fp-a", lock, now)
            .await
            .unwrap()
        {
            IdempotencyDecision::Replay { status, body } => {
                assert_eq!(status, 201);
                assert_eq!(body, b"created");
            }
            other => panic!("expected replay, got {other:?}"),
        }
        // Duplicate with different body: conflict.
        assert_eq!(
            store
                .begin("orders", "key-1", Some("u1"), "fp-b", lock, now)
                .await
                .unwrap(),
            IdempotencyDecision::FingerprintMismatch
        );
        // Expired: treated as new.
        let later = now + chrono::Duration::hours(25);
        assert_eq!(
            store
                .begin("orders", "key-1", Some("u1"), "fp-b", lock, later)
                .await
                .unwrap(),
            IdempotencyDecision::Fresh
        );
    }

    #[tokio::test]
    async fn http_key_length_validated() {
        let store = MemoryStore::new();
        let long = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        let err = store
            .begin("orders", &long, None, "fp", Duration::from_secs(1), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn offsets_round_trip() {
        let store = MemoryStore::new();
        assert!(store.committed("g", "t").await.unwrap().is_none());
        store.commit("g", "t", 42).await.unwrap();
        assert_eq!(store.committed("g", "t").await.unwrap(), Some(42));
    }
}
