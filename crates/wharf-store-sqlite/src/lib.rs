#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-store-sqlite** – SQLite-based persistent storage driver for Wharf.
//!
//! This crate implements every `wharf-store-core` trait on top of SQLite via
//! sqlx. Aggregate saves run as a single multi-statement transaction covering
//! the snapshot upsert and the outbox inserts, which is what gives the outbox
//! its atomicity guarantee. Outbox claiming uses a per-row lease column
//! rather than `SKIP LOCKED`, so the memory and SQLite drivers share claim
//! semantics.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use wharf_events::AggregateType;
use wharf_store_core::{
    AggregateDoc, AggregateStore, ConsumerDedupStore, DedupRecord, DedupStatus,
    HttpIdempotencyState, HttpIdempotencyStore, IdempotencyDecision, OffsetStore, OutboxRow,
    OutboxStore, Reservation, StoreError, DEFAULT_DEDUP_TTL, HTTP_IDEMPOTENCY_RETENTION,
    MAX_IDEMPOTENCY_KEY_LEN,
};

//─────────────────────────────
//  SQLite store
//─────────────────────────────

/// Durable store backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    dedup_ttl: Duration,
}

impl SqliteStore {
    /// Opens or creates a database at `path` and runs migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Opens an in-memory database, for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and runs migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            dedup_ttl: DEFAULT_DEDUP_TTL,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Override the dedup record TTL.
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS aggregates (
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (aggregate_type, aggregate_id)
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BLOB PRIMARY KEY,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                topic TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL,
                published_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error TEXT,
                claimed_until TEXT
            ) STRICT
            "#,
            "CREATE INDEX IF NOT EXISTS idx_outbox_poll ON outbox(published_at, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS consumer_dedup (
                consumer_group TEXT NOT NULL,
                event_id BLOB NOT NULL,
                first_seen_at TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                lease_until TEXT,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (consumer_group, event_id)
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                service TEXT NOT NULL,
                idem_key TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                request_fingerprint TEXT NOT NULL,
                response_status INTEGER,
                response_body BLOB,
                state TEXT NOT NULL,
                lock_expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (service, idem_key, user_id)
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS consumer_offsets (
                group_name TEXT NOT NULL,
                topic TEXT NOT NULL,
                next_offset INTEGER NOT NULL,
                PRIMARY KEY (group_name, topic)
            ) STRICT
            "#,
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

// Fixed-width RFC 3339 so the TEXT columns sort chronologically.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {value:?}: {e}")))
}

fn lease_end(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, StoreError> {
    Ok(now + chrono::Duration::from_std(lease).map_err(|e| StoreError::Backend(e.to_string()))?)
}

async fn insert_fresh_key(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    service: &str,
    key: &str,
    user: &str,
    fingerprint: &str,
    lock_expires_at: &str,
    created_at: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO idempotency_keys \
         (service, idem_key, user_id, request_fingerprint, response_status, \
          response_body, state, lock_expires_at, created_at) \
         VALUES (?, ?, ?, ?, NULL, NULL, 'in_flight', ?, ?)",
    )
    .bind(service)
    .bind(key)
    .bind(user)
    .bind(fingerprint)
    .bind(lock_expires_at)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn outbox_row_from(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRow, StoreError> {
    let id_bytes: Vec<u8> = row.get("id");
    let aggregate_type: String = row.get("aggregate_type");
    let published_at: Option<String> = row.get("published_at");
    let claimed_until: Option<String> = row.get("claimed_until");
    let created_at: String = row.get("created_at");
    Ok(OutboxRow {
        id: Uuid::from_slice(&id_bytes).map_err(|e| StoreError::Backend(e.to_string()))?,
        aggregate_id: row.get("aggregate_id"),
        aggregate_type: AggregateType::from_str(&aggregate_type)
            .map_err(StoreError::Backend)?,
        topic: row.get("topic"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        created_at: parse_ts(&created_at)?,
        published_at: published_at.as_deref().map(parse_ts).transpose()?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        last_error: row.get("last_error"),
        claimed_until: claimed_until.as_deref().map(parse_ts).transpose()?,
    })
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn load(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: &str,
    ) -> Result<Option<AggregateDoc>, StoreError> {
        let row = sqlx::query(
            "SELECT version, state, updated_at FROM aggregates \
             WHERE aggregate_type = ? AND aggregate_id = ?",
        )
        .bind(aggregate_type.as_str())
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let state: String = row.get("state");
                let updated_at: String = row.get("updated_at");
                Ok(Some(AggregateDoc {
                    aggregate_id: aggregate_id.to_owned(),
                    aggregate_type,
                    version: row.get::<i64, _>("version") as u64,
                    state: serde_json::from_str(&state)?,
                    updated_at: parse_ts(&updated_at)?,
                }))
            }
        }
    }

    async fn save(&self, doc: AggregateDoc, outbox: Vec<OutboxRow>) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let stored: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM aggregates WHERE aggregate_type = ? AND aggregate_id = ?",
        )
        .bind(doc.aggregate_type.as_str())
        .bind(&doc.aggregate_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let stored_version = stored.unwrap_or(0) as u64;
        if stored_version != doc.version.saturating_sub(1) {
            return Err(StoreError::VersionConflict {
                aggregate_id: doc.aggregate_id,
                expected: doc.version.saturating_sub(1),
                actual: stored_version,
            });
        }

        sqlx::query(
            "INSERT OR REPLACE INTO aggregates \
             (aggregate_type, aggregate_id, version, state, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(doc.aggregate_type.as_str())
        .bind(&doc.aggregate_id)
        .bind(doc.version as i64)
        .bind(serde_json::to_string(&doc.state)?)
        .bind(ts(doc.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        for row in &outbox {
            sqlx::query(
                "INSERT INTO outbox \
                 (id, aggregate_id, aggregate_type, topic, event_type, payload, \
                  created_at, published_at, attempts, max_attempts, last_error, claimed_until) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL, NULL)",
            )
            .bind(row.id.as_bytes().as_slice())
            .bind(&row.aggregate_id)
            .bind(row.aggregate_type.as_str())
            .bind(&row.topic)
            .bind(&row.event_type)
            .bind(&row.payload)
            .bind(ts(row.created_at))
            .bind(row.attempts as i64)
            .bind(row.max_attempts as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn claim_batch(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let now_s = ts(now);

        // Candidate rows: unpublished, under the attempt cap, lease lapsed,
        // and with no older blocked sibling for the same aggregate (order
        // preservation across relays).
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox o
            WHERE o.published_at IS NULL
              AND o.attempts < o.max_attempts
              AND (o.claimed_until IS NULL OR o.claimed_until <= ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM outbox b
                  WHERE b.aggregate_id = o.aggregate_id
                    AND b.published_at IS NULL
                    AND b.created_at < o.created_at
                    AND (b.attempts >= b.max_attempts
                         OR (b.claimed_until IS NOT NULL AND b.claimed_until > ?1))
              )
            ORDER BY o.created_at ASC
            LIMIT ?2
            "#,
        )
        .bind(&now_s)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let lease_until = ts(lease_end(now, lease)?);
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut parsed = outbox_row_from(row)?;
            sqlx::query("UPDATE outbox SET claimed_until = ? WHERE id = ?")
                .bind(&lease_until)
                .bind(parsed.id.as_bytes().as_slice())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            parsed.claimed_until = Some(parse_ts(&lease_until)?);
            claimed.push(parsed);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET published_at = ?, claimed_until = NULL WHERE id = ?",
        )
        .bind(ts(now))
        .bind(id.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?, claimed_until = NULL \
             WHERE id = ?",
        )
        .bind(error)
        .bind(id.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox \
             WHERE published_at IS NULL AND attempts < max_attempts",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM outbox \
             WHERE published_at IS NULL AND attempts >= max_attempts \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(outbox_row_from).collect()
    }
}

#[async_trait]
impl ConsumerDedupStore for SqliteStore {
    async fn reserve(
        &self,
        group: &str,
        event_id: Uuid,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let lease_until = ts(lease_end(now, lease)?);
        let expires_at = ts(lease_end(now, self.dedup_ttl)?);

        let existing = sqlx::query(
            "SELECT status, lease_until, expires_at FROM consumer_dedup \
             WHERE consumer_group = ? AND event_id = ?",
        )
        .bind(group)
        .bind(event_id.as_bytes().as_slice())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let reservation = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO consumer_dedup \
                     (consumer_group, event_id, first_seen_at, status, attempts, lease_until, expires_at) \
                     VALUES (?, ?, ?, 'in_progress', 0, ?, ?)",
                )
                .bind(group)
                .bind(event_id.as_bytes().as_slice())
                .bind(ts(now))
                .bind(&lease_until)
                .bind(&expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
                Reservation::Acquired
            }
            Some(row) => {
                let status: String = row.get("status");
                let record_lease: Option<String> = row.get("lease_until");
                let record_expiry: String = row.get("expires_at");
                if parse_ts(&record_expiry)? <= now {
                    sqlx::query(
                        "UPDATE consumer_dedup \
                         SET first_seen_at = ?, status = 'in_progress', attempts = 0, \
                             lease_until = ?, expires_at = ? \
                         WHERE consumer_group = ? AND event_id = ?",
                    )
                    .bind(ts(now))
                    .bind(&lease_until)
                    .bind(&expires_at)
                    .bind(group)
                    .bind(event_id.as_bytes().as_slice())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                    Reservation::Acquired
                } else {
                    match status.as_str() {
                        "succeeded" => Reservation::AlreadySucceeded,
                        "in_progress"
                            if record_lease
                                .as_deref()
                                .map(parse_ts)
                                .transpose()?
                                .map(|l| l > now)
                                .unwrap_or(false) =>
                        {
                            Reservation::InFlight
                        }
                        _ => {
                            sqlx::query(
                                "UPDATE consumer_dedup \
                                 SET status = 'in_progress', lease_until = ? \
                                 WHERE consumer_group = ? AND event_id = ?",
                            )
                            .bind(&lease_until)
                            .bind(group)
                            .bind(event_id.as_bytes().as_slice())
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| StoreError::Backend(e.to_string()))?;
                            Reservation::Acquired
                        }
                    }
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(reservation)
    }

    async fn mark_succeeded(
        &self,
        group: &str,
        event_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE consumer_dedup SET status = 'succeeded', lease_until = NULL \
             WHERE consumer_group = ? AND event_id = ?",
        )
        .bind(group)
        .bind(event_id.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dedup record {group}/{event_id}")));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        group: &str,
        event_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE consumer_dedup \
             SET status = 'failed', attempts = attempts + 1, lease_until = NULL \
             WHERE consumer_group = ? AND event_id = ?",
        )
        .bind(group)
        .bind(event_id.as_bytes().as_slice())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dedup record {group}/{event_id}")));
        }
        let attempts: i64 = sqlx::query_scalar(
            "SELECT attempts FROM consumer_dedup WHERE consumer_group = ? AND event_id = ?",
        )
        .bind(group)
        .bind(event_id.as_bytes().as_slice())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(attempts as u32)
    }

    async fn status(
        &self,
        group: &str,
        event_id: Uuid,
    ) -> Result<Option<DedupRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT first_seen_at, status, attempts, lease_until, expires_at \
             FROM consumer_dedup WHERE consumer_group = ? AND event_id = ?",
        )
        .bind(group)
        .bind(event_id.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                let first_seen: String = row.get("first_seen_at");
                let lease_until: Option<String> = row.get("lease_until");
                let expires_at: String = row.get("expires_at");
                Ok(Some(DedupRecord {
                    consumer_group: group.to_owned(),
                    event_id,
                    first_seen_at: parse_ts(&first_seen)?,
                    status: match status.as_str() {
                        "in_progress" => DedupStatus::InProgress,
                        "succeeded" => DedupStatus::Succeeded,
                        "failed" => DedupStatus::Failed,
                        other => {
                            return Err(StoreError::Backend(format!(
                                "unknown dedup status {other:?}"
                            )))
                        }
                    },
                    attempts: row.get::<i64, _>("attempts") as u32,
                    lease_until: lease_until.as_deref().map(parse_ts).transpose()?,
                    expires_at: parse_ts(&expires_at)?,
                }))
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM consumer_dedup WHERE expires_at <= ?")
            .bind(ts(now))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl HttpIdempotencyStore for SqliteStore {
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
        let user = user_id.unwrap_or("");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let lock_expires_at = ts(lease_end(now, lock)?);
        let retention_cutoff = now
            - chrono::Duration::from_std(HTTP_IDEMPOTENCY_RETENTION)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

        let existing = sqlx::query(
            "SELECT request_fingerprint, response_status, response_body, state, \
                    lock_expires_at, created_at \
             FROM idempotency_keys WHERE service = ? AND idem_key = ? AND user_id = ?",
        )
        .bind(service)
        .bind(key)
        .bind(user)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let now_s = ts(now);
        let decision = match existing {
            None => {
                insert_fresh_key(&mut tx, service, key, user, fingerprint, &lock_expires_at, &now_s)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                IdempotencyDecision::Fresh
            }
            Some(row) => {
                let created_at = parse_ts(&row.get::<String, _>("created_at"))?;
                let stored_fingerprint: String = row.get("request_fingerprint");
                let state: String = row.get("state");
                if created_at <= retention_cutoff {
                    insert_fresh_key(
                        &mut tx, service, key, user, fingerprint, &lock_expires_at, &now_s,
                    )
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                    IdempotencyDecision::Fresh
                } else if stored_fingerprint != fingerprint {
                    IdempotencyDecision::FingerprintMismatch
                } else if state == "done" {
                    IdempotencyDecision::Replay {
                        status: row.get::<Option<i64>, _>("response_status").unwrap_or(200) as u16,
                        body: row
                            .get::<Option<Vec<u8>>, _>("response_body")
                            .unwrap_or_default(),
                    }
                } else if parse_ts(&row.get::<String, _>("lock_expires_at"))? <= now {
                    insert_fresh_key(
                        &mut tx, service, key, user, fingerprint, &lock_expires_at, &now_s,
                    )
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                    IdempotencyDecision::Fresh
                } else {
                    IdempotencyDecision::InFlight
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(decision)
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
        let result = sqlx::query(
            "UPDATE idempotency_keys \
             SET response_status = ?, response_body = ?, state = 'done' \
             WHERE service = ? AND idem_key = ? AND user_id = ?",
        )
        .bind(status as i64)
        .bind(body)
        .bind(service)
        .bind(key)
        .bind(user_id.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("idempotency key {key}")));
        }
        Ok(())
    }

    async fn abandon(
        &self,
        service: &str,
        key: &str,
        user_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE service = ? AND idem_key = ? AND user_id = ?",
        )
        .bind(service)
        .bind(key)
        .bind(user_id.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for SqliteStore {
    async fn committed(&self, group: &str, topic: &str) -> Result<Option<u64>, StoreError> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM consumer_offsets WHERE group_name = ? AND topic = ?",
        )
        .bind(group)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(offset.map(|o| o as u64))
    }

    async fn commit(&self, group: &str, topic: &str, offset: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO consumer_offsets (group_name, topic, next_offset) \
             VALUES (?, ?, ?)",
        )
        .bind(group)
        .bind(topic)
        .bind(offset as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
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
    async fn save_and_load_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .save(doc("ORD-1", 1), vec![outbox_row("ORD-1", Utc::now())])
            .await
            .unwrap();

        let loaded = store
            .load(AggregateType::Order, "ORD-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state["status"], "received");
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_save_rolls_back_outbox() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save(doc("ORD-1", 1), vec![]).await.unwrap();

        let err = store
            .save(doc("ORD-1", 1), vec![outbox_row("ORD-1", Utc::now())])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        // The staged row from the failed save is not visible.
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_publish_and_fail_cycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let first = outbox_row("ORD-1", now - chrono::Duration::seconds(5));
        let second = outbox_row("ORD-1", now);
        store
            .save(doc("ORD-1", 1), vec![first.clone(), second.clone()])
            .await
            .unwrap();

        let batch = store
            .claim_batch(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first.id);

        store.mark_published(first.id, now).await.unwrap();
        wharf_store_core::OutboxStore::mark_failed(&store, second.id, "broker timeout", now)
            .await
            .unwrap();

        // Failed row is immediately re-claimable (lease cleared).
        let retry = store
            .claim_batch(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, second.id);
        assert_eq!(retry[0].attempts, 1);
        assert_eq!(retry[0].last_error.as_deref(), Some("broker timeout"));
    }

    #[tokio::test]
    async fn leased_older_row_blocks_same_aggregate() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let older = outbox_row("ORD-1", now - chrono::Duration::seconds(5));
        let newer = outbox_row("ORD-1", now);
        store
            .save(doc("ORD-1", 1), vec![older.clone(), newer.clone()])
            .await
            .unwrap();

        let batch = store
            .claim_batch(1, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert_eq!(batch[0].id, older.id);

        // Another relay polls while the older row is leased: the newer row of
        // the same aggregate must not jump the queue.
        let other = store
            .claim_batch(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn dead_letters_surface_for_inspection() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let row = outbox_row("ORD-1", now);
        let id = row.id;
        store.save(doc("ORD-1", 1), vec![row]).await.unwrap();

        for _ in 0..wharf_store_core::DEFAULT_MAX_ATTEMPTS {
            wharf_store_core::OutboxStore::mark_failed(&store, id, "bus down", now)
                .await
                .unwrap();
        }
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].is_dead_lettered());
        assert!(store
            .claim_batch(10, Duration::from_secs(1), now)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn dedup_reserve_matrix() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4();
        let lease = Duration::from_secs(30);

        assert_eq!(
            store.reserve("g", id, lease, now).await.unwrap(),
            Reservation::Acquired
        );
        assert_eq!(
            store.reserve("g", id, lease, now).await.unwrap(),
            Reservation::InFlight
        );
        store.mark_succeeded("g", id, now).await.unwrap();
        assert_eq!(
            store.reserve("g", id, lease, now).await.unwrap(),
            Reservation::AlreadySucceeded
        );

        let failed_id = Uuid::new_v4();
        store.reserve("g", failed_id, lease, now).await.unwrap();
        assert_eq!(
            wharf_store_core::ConsumerDedupStore::mark_failed(&store, "g", failed_id, now)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.reserve("g", failed_id, lease, now).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn http_idempotency_matrix() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let lock = Duration::from_secs(30);

        assert_eq!(
            store
                .begin("orders", "key-1", None, "fp-a", lock, now)
                .await
                .unwrap(),
            IdempotencyDecision::Fresh
        );
        store
            .complete("orders", "key-1", None, 201, b"created".to_vec(), now)
            .await
            .unwrap();
        match store
            .begin("orders", "key-1", None, "fp-a", lock, now)
            .await
            .unwrap()
        {
            IdempotencyDecision::Replay { status, body } => {
                assert_eq!(status, 201);
                assert_eq!(body, b"created");
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(
            store
                .begin("orders", "key-1", None, "fp-b", lock, now)
                .await
                .unwrap(),
            IdempotencyDecision::FingerprintMismatch
        );
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wharf.db");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store
                .save(doc("ORD-1", 1), vec![outbox_row("ORD-1", Utc::now())])
                .await
                .unwrap();
            store.commit("g", "t", 7).await.unwrap();
            store.close().await;
        }
        {
            let store = SqliteStore::open(&path).await.unwrap();
            assert!(store
                .load(AggregateType::Order, "ORD-1")
                .await
                .unwrap()
                .is_some());
            assert_eq!(store.pending_count().await.unwrap(), 1);
            assert_eq!(store.committed("g", "t").await.unwrap(), Some(7));
        }
    }
}
