#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-store-core** – Core storage abstractions for Wharf.
//!
//! This crate defines the contracts every storage driver implements: the
//! aggregate store with transactional-outbox save semantics, the outbox
//! claim/lease store the relay drains, the consumer dedup store, the HTTP
//! idempotency store, and the consumer offset store. Drivers (memory, SQLite)
//! live in sibling crates that depend on this core abstraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wharf_events::AggregateType;

/// Relay parking threshold: rows failing this many publishes stay for
/// inspection.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retention for HTTP idempotency records.
pub const HTTP_IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default TTL for consumer dedup records. Must be at least the retention of
/// the upstream topic.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Maximum accepted `Idempotency-Key` length.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by storage drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed; reload and retry.
    #[error("version conflict for {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Aggregate whose write lost the race.
        aggregate_id: String,
        /// Version the writer expected to replace.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },
    /// Record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Rejected key or record shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// Payload could not be serialized or parsed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Driver-level failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

//─────────────────────────────
//  Aggregate documents
//─────────────────────────────

/// Persisted snapshot of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDoc {
    /// Natural aggregate id.
    pub aggregate_id: String,
    /// Aggregate kind; together with the id this is the unique key.
    pub aggregate_type: AggregateType,
    /// Version this document carries. Saves succeed only when the stored
    /// version is exactly `version - 1` (zero meaning "not yet stored").
    pub version: u64,
    /// Aggregate state as a JSON document.
    pub state: serde_json::Value,
    /// Last write instant.
    pub updated_at: DateTime<Utc>,
}

/// Store for aggregate snapshots with transactional outbox semantics.
///
/// `save` must commit the document upsert and every outbox row in one
/// storage transaction: either all become visible to subsequent reads or
/// none do. This is the producer half of the at-least-once pipeline.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Fetch a snapshot by type and natural id.
    async fn load(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: &str,
    ) -> Result<Option<AggregateDoc>, StoreError>;

    /// Atomically upsert `doc` and insert `outbox` rows.
    ///
    /// The write is admitted only if the stored version equals
    /// `doc.version - 1`; otherwise [`StoreError::VersionConflict`] is
    /// returned and nothing is written.
    async fn save(&self, doc: AggregateDoc, outbox: Vec<OutboxRow>) -> Result<(), StoreError>;
}

//─────────────────────────────
//  Outbox rows
//─────────────────────────────

/// One staged event awaiting publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Row id; equals the CloudEvent envelope id so consumers can
    /// deduplicate across relay retries.
    pub id: Uuid,
    /// Aggregate the event belongs to; also the bus partition key.
    pub aggregate_id: String,
    /// Aggregate kind.
    pub aggregate_type: AggregateType,
    /// Destination topic.
    pub topic: String,
    /// Dotted event type, for inspection.
    pub event_type: String,
    /// Serialized CloudEvent envelope.
    pub payload: Vec<u8>,
    /// Staging instant; the relay drains oldest first.
    pub created_at: DateTime<Utc>,
    /// Set once the bus acknowledged the publish.
    pub published_at: Option<DateTime<Utc>>,
    /// Publish attempts so far.
    pub attempts: u32,
    /// Parking threshold.
    pub max_attempts: u32,
    /// Last publish error, for inspection.
    pub last_error: Option<String>,
    /// Relay lease; the row is re-claimable after this instant.
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRow {
    /// Stage a new row for an envelope.
    pub fn new(
        id: Uuid,
        aggregate_id: String,
        aggregate_type: AggregateType,
        topic: String,
        event_type: String,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            aggregate_id,
            aggregate_type,
            topic,
            event_type,
            payload,
            created_at,
            published_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            claimed_until: None,
        }
    }

    /// Whether the relay already delivered this row.
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Whether the row is parked for inspection.
    pub fn is_dead_lettered(&self) -> bool {
        !self.is_published() && self.attempts >= self.max_attempts
    }

    /// Whether a relay may claim the row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_published()
            && !self.is_dead_lettered()
            && self.claimed_until.map(|until| until <= now).unwrap_or(true)
    }
}

/// Store the relay drains. Claiming takes a short lease per row so that
/// concurrent relays on other instances cannot double-publish; a crashed
/// relay's rows become re-claimable when the lease lapses.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` claimable rows, oldest `created_at`
    /// first, holding each under a lease until `now + lease`.
    async fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError>;

    /// Record a successful publish.
    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a failed publish: increments attempts, stores the error,
    /// clears the lease so the row is retried after backoff.
    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Rows still awaiting publication (claimable or leased, not parked).
    async fn pending_count(&self) -> Result<u64, StoreError>;

    /// Rows parked at `max_attempts`, for human inspection.
    async fn dead_letters(&self) -> Result<Vec<OutboxRow>, StoreError>;
}

//─────────────────────────────
//  Consumer dedup store
//─────────────────────────────

/// Outcome of a consumer's reserve step for one `(group, event id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This worker owns the event; run the handler.
    Acquired,
    /// A previous delivery already succeeded; skip.
    AlreadySucceeded,
    /// Another worker holds an unexpired lease; skip, the bus will
    /// redeliver.
    InFlight,
}

/// Processing status of a dedup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    /// A worker holds the reservation.
    InProgress,
    /// Handler side effects committed.
    Succeeded,
    /// Handler failed; eligible for re-claim.
    Failed,
}

/// Idempotency record for one `(consumer group, event id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Consumer group that owns the record.
    pub consumer_group: String,
    /// CloudEvent envelope id.
    pub event_id: Uuid,
    /// First delivery instant.
    pub first_seen_at: DateTime<Utc>,
    /// Current status.
    pub status: DedupStatus,
    /// Handler failures recorded so far.
    pub attempts: u32,
    /// Reservation lease expiry while in progress.
    pub lease_until: Option<DateTime<Utc>>,
    /// Record expiry; must exceed upstream topic retention.
    pub expires_at: DateTime<Utc>,
}

/// At-most-once gate for consumer side effects.
#[async_trait]
pub trait ConsumerDedupStore: Send + Sync {
    /// Atomically reserve `(group, event_id)`.
    ///
    /// Absent or expired records are (re-)claimed as `in_progress` under a
    /// lease of `lease`; failed records are re-claimed immediately.
    async fn reserve(
        &self,
        group: &str,
        event_id: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError>;

    /// Mark the reservation succeeded.
    async fn mark_succeeded(
        &self,
        group: &str,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark the reservation failed. Returns the total failure count for the
    /// record so the caller can decide when to dead-letter.
    async fn mark_failed(
        &self,
        group: &str,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Current record, if any.
    async fn status(&self, group: &str, event_id: Uuid) -> Result<Option<DedupRecord>, StoreError>;

    /// Drop records past their TTL. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

//─────────────────────────────
//  HTTP idempotency store
//─────────────────────────────

/// Decision for an incoming mutating request carrying an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyDecision {
    /// Key unseen (or expired): execute the request and cache the response.
    Fresh,
    /// Same key, same request fingerprint, response cached: replay it.
    Replay {
        /// Cached response status.
        status: u16,
        /// Cached response body.
        body: Vec<u8>,
    },
    /// Same key but a different request body: reject as a conflict.
    FingerprintMismatch,
    /// Same key, original request still executing.
    InFlight,
}

/// Request processing state for one HTTP idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpIdempotencyState {
    /// Original request executing.
    InFlight,
    /// Response cached.
    Done,
}

/// Cached record for one `(service, key, user)` scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpIdempotencyRecord {
    /// Owning service.
    pub service: String,
    /// Client-supplied key.
    pub key: String,
    /// Optional user scoping.
    pub user_id: Option<String>,
    /// Digest of the request body.
    pub request_fingerprint: String,
    /// Cached response status, once done.
    pub response_status: Option<u16>,
    /// Cached response body, once done.
    pub response_body: Option<Vec<u8>>,
    /// Processing state.
    pub state: HttpIdempotencyState,
    /// In-flight lock expiry.
    pub lock_expires_at: DateTime<Utc>,
    /// Record creation; retention runs from here.
    pub created_at: DateTime<Utc>,
}

/// Store behind the `Idempotency-Key` header contract.
#[async_trait]
pub trait HttpIdempotencyStore: Send + Sync {
    /// Atomically evaluate a request against the behavior matrix. On
    /// `Fresh` the record is locked `in_flight` until `now + lock`.
    async fn begin(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
        fingerprint: &str,
        lock: Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyDecision, StoreError>;

    /// Cache the response for a key previously admitted as `Fresh`.
    async fn complete(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
        status: u16,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop the in-flight record after a handler failure so the client can
    /// retry.
    async fn abandon(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

//─────────────────────────────
//  Consumer offsets
//─────────────────────────────

/// Committed read positions per `(consumer group, topic)`.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Next offset the group should read from, if one was committed.
    async fn committed(&self, group: &str, topic: &str) -> Result<Option<u64>, StoreError>;

    /// Commit the next offset to read.
    async fn commit(&self, group: &str, topic: &str, offset: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(attempts: u32, published: bool, claimed_until: Option<DateTime<Utc>>) -> OutboxRow {
        let mut row = OutboxRow::new(
            Uuid::new_v4(),
            "ORD-1".to_owned(),
            AggregateType::Order,
            "wms.orders.events".to_owned(),
            "order.received".to_owned(),
            vec![],
            Utc::now(),
        );
        row.attempts = attempts;
        if published {
            row.published_at = Some(Utc::now());
        }
        row.claimed_until = claimed_until;
        row
    }

    #[test]
    fn claimability_rules() {
        let now = Utc::now();
        assert!(row(0, false, None).is_claimable(now));
        assert!(!row(0, true, None).is_claimable(now));
        assert!(!row(DEFAULT_MAX_ATTEMPTS, false, None).is_claimable(now));
        // Unexpired lease blocks, expired lease re-admits.
        let leased = row(1, false, Some(now + chrono::Duration::seconds(30)));
        assert!(!leased.is_claimable(now));
        let lapsed = row(1, false, Some(now - chrono::Duration::seconds(1)));
        assert!(lapsed.is_claimable(now));
    }

    #[test]
    fn dead_letter_threshold() {
        assert!(!row(DEFAULT_MAX_ATTEMPTS - 1, false, None).is_dead_lettered());
        assert!(row(DEFAULT_MAX_ATTEMPTS, false, None).is_dead_lettered());
        assert!(!row(DEFAULT_MAX_ATTEMPTS, true, None).is_dead_lettered());
    }
}
