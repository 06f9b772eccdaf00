//! Generic aggregate repository bridging domain aggregates and the
//! transactional-outbox store.

use std::sync::Arc;

use tracing::debug;

use wharf_domain::Aggregate;
use wharf_events::CloudEvent;
use wharf_store_core::{AggregateDoc, AggregateStore, OutboxRow, StoreError};
use wharf_types::{Clock, CorrelationContext, ErrorCode, WmsError};

/// How many times an optimistic write is retried by reloading.
const MAX_VERSION_RETRIES: u32 = 3;

/// Loads and saves aggregates, converting buffered domain events into
/// CloudEvents-serialized outbox rows staged in the same transaction as the
/// snapshot upsert.
#[derive(Clone)]
pub struct AggregateRepository {
    store: Arc<dyn AggregateStore>,
    service: String,
    clock: Arc<dyn Clock>,
}

impl AggregateRepository {
    /// Create a repository writing as `service` (the CloudEvents source).
    pub fn new(
        store: Arc<dyn AggregateStore>,
        service: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            service: service.into(),
            clock,
        }
    }

    /// Clock shared with the aggregates this repository persists.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Load an aggregate snapshot by natural id.
    pub async fn load<A: Aggregate>(&self, id: &str) -> Result<Option<A>, WmsError> {
        let doc = self
            .store
            .load(A::aggregate_type(), id)
            .await
            .map_err(map_store_err)?;
        match doc {
            None => Ok(None),
            Some(doc) => {
                let mut aggregate: A = serde_json::from_value(doc.state).map_err(|e| {
                    WmsError::internal(format!("corrupt snapshot for {id}")).with_source(e)
                })?;
                aggregate.set_version(doc.version);
                Ok(Some(aggregate))
            }
        }
    }

    /// Persist the aggregate and stage its buffered events.
    ///
    /// A save with an empty buffer is a no-op: replaying a command that
    /// already committed produces no state change, no events, and therefore
    /// no write. On success the buffer is cleared and the version advanced.
    pub async fn save<A: Aggregate>(
        &self,
        aggregate: &mut A,
        ctx: &CorrelationContext,
    ) -> Result<(), WmsError> {
        if aggregate.pending_events().is_empty() {
            debug!(
                aggregate = %aggregate.aggregate_id(),
                "no pending events, skipping save"
            );
            return Ok(());
        }

        let version = aggregate.version() + 1;
        let mut rows = Vec::with_capacity(aggregate.pending_events().len());
        for event in aggregate.pending_events() {
            let envelope = CloudEvent::from_domain_event(&self.service, event, ctx)
                .map_err(|e| WmsError::internal("envelope conversion failed").with_source(e))?;
            let payload = envelope
                .to_bytes()
                .map_err(|e| WmsError::internal("envelope serialization failed").with_source(e))?;
            rows.push(OutboxRow::new(
                envelope.id,
                event.aggregate_id.clone(),
                event.aggregate_type,
                event.topic().as_str().to_owned(),
                event.event_type().to_owned(),
                payload,
                self.clock.now(),
            ));
        }

        let doc = AggregateDoc {
            aggregate_id: aggregate.aggregate_id(),
            aggregate_type: A::aggregate_type(),
            version,
            state: serde_json::to_value(&*aggregate)
                .map_err(|e| WmsError::internal("snapshot serialization failed").with_source(e))?,
            updated_at: self.clock.now(),
        };

        self.store.save(doc, rows).await.map_err(map_store_err)?;
        aggregate.take_events();
        aggregate.set_version(version);
        Ok(())
    }

    /// Load, mutate and save, retrying version conflicts by reloading.
    pub async fn update<A, F>(
        &self,
        id: &str,
        ctx: &CorrelationContext,
        mut mutate: F,
    ) -> Result<A, WmsError>
    where
        A: Aggregate,
        F: FnMut(&mut A) -> Result<(), WmsError>,
    {
        for attempt in 0..MAX_VERSION_RETRIES {
            let mut aggregate: A = self.load(id).await?.ok_or_else(|| {
                WmsError::not_found(format!(
                    "{} {id} does not exist",
                    A::aggregate_type().as_str()
                ))
            })?;
            mutate(&mut aggregate)?;
            match self.save(&mut aggregate, ctx).await {
                Ok(()) => return Ok(aggregate),
                Err(err) if is_version_conflict(&err) => {
                    debug!(aggregate = id, attempt, "version conflict, reloading");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(WmsError::conflict(format!(
            "gave up updating {id} after {MAX_VERSION_RETRIES} version conflicts"
        )))
    }

    /// Create an aggregate under its natural key, or return the existing
    /// one. Losing the insert race falls back to loading the winner, so
    /// replayed create commands produce exactly one aggregate and one set of
    /// creation events.
    pub async fn create_if_absent<A, F>(&self, id: &str, ctx: &CorrelationContext, build: F) -> Result<A, WmsError>
    where
        A: Aggregate,
        F: FnOnce() -> Result<A, WmsError>,
    {
        if let Some(existing) = self.load::<A>(id).await? {
            debug!(aggregate = id, "already exists, create is a no-op");
            return Ok(existing);
        }
        let mut aggregate = build()?;
        match self.save(&mut aggregate, ctx).await {
            Ok(()) => Ok(aggregate),
            Err(err) if is_version_conflict(&err) => {
                self.load::<A>(id).await?.ok_or_else(|| {
                    WmsError::internal(format!("lost create race for {id} but found nothing"))
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn is_version_conflict(err: &WmsError) -> bool {
    err.code == ErrorCode::Conflict
        && err.details.get("kind").map(String::as_str) == Some("version_conflict")
}

fn map_store_err(err: StoreError) -> WmsError {
    match err {
        StoreError::VersionConflict {
            aggregate_id,
            expected,
            actual,
        } => WmsError::conflict(format!(
            "stale write for {aggregate_id}: expected version {expected}, found {actual}"
        ))
        .with_detail("kind", "version_conflict"),
        StoreError::NotFound(what) => WmsError::not_found(what),
        StoreError::InvalidKey(what) => WmsError::validation(what),
        StoreError::Serialization(e) => {
            WmsError::internal("storage serialization failed").with_source(e)
        }
        StoreError::Backend(what) => WmsError::unavailable(what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_domain::{Order, OrderStatus};
    use wharf_events::OrderLine;
    use wharf_store_core::OutboxStore;
    use wharf_store_memory::MemoryStore;
    use wharf_types::{CustomerId, OrderId, Priority, SystemClock};

    fn repo(store: &MemoryStore) -> AggregateRepository {
        AggregateRepository::new(Arc::new(store.clone()), "order-service", Arc::new(SystemClock))
    }

    fn new_order(id: &str) -> Order {
        Order::create(
            OrderId::from(id),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            vec![OrderLine {
                sku: "SKU-A".into(),
                quantity: 2,
                zone: None,
            }],
            &SystemClock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_stages_outbox_rows_and_clears_buffer() {
        let store = MemoryStore::new();
        let repo = repo(&store);
        let ctx = CorrelationContext::new();
        let mut order = new_order("ORD-1");

        repo.save(&mut order, &ctx).await.unwrap();
        assert!(order.pending_events().is_empty());
        assert_eq!(order.version(), 1);

        let rows = store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "order.received");
        assert_eq!(rows[0].topic, "wms.orders.events");
        let envelope = CloudEvent::from_bytes(&rows[0].payload).unwrap();
        assert_eq!(envelope.wmscorrelationid, ctx.correlation_id);
        // The row id doubles as the envelope id for consumer dedup.
        assert_eq!(rows[0].id, envelope.id);
    }

    #[tokio::test]
    async fn empty_buffer_save_writes_nothing() {
        let store = MemoryStore::new();
        let repo = repo(&store);
        let ctx = CorrelationContext::new();
        let mut order = new_order("ORD-1");
        repo.save(&mut order, &ctx).await.unwrap();

        // A reloaded aggregate with no new commands saves nothing.
        let mut reloaded: Order = repo.load("ORD-1").await.unwrap().unwrap();
        repo.save(&mut reloaded, &ctx).await.unwrap();
        assert_eq!(reloaded.version(), 1);
        assert_eq!(store.outbox_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent_on_natural_key() {
        let store = MemoryStore::new();
        let repo = repo(&store);
        let ctx = CorrelationContext::new();

        let first: Order = repo
            .create_if_absent("ORD-1", &ctx, || Ok(new_order("ORD-1")))
            .await
            .unwrap();
        assert_eq!(first.status(), OrderStatus::Received);

        // Replayed create: same aggregate, no second OrderReceived row.
        let second: Order = repo
            .create_if_absent("ORD-1", &ctx, || Ok(new_order("ORD-1")))
            .await
            .unwrap();
        assert_eq!(second.version(), 1);
        assert_eq!(store.aggregate_count().await, 1);
        let received = store
            .outbox_rows()
            .await
            .iter()
            .filter(|r| r.event_type == "order.received")
            .count();
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn update_applies_command_and_bumps_version() {
        let store = MemoryStore::new();
        let repo = repo(&store);
        let ctx = CorrelationContext::new();
        let mut order = new_order("ORD-1");
        repo.save(&mut order, &ctx).await.unwrap();

        let updated: Order = repo
            .update("ORD-1", &ctx, |o: &mut Order| o.validate(&SystemClock))
            .await
            .unwrap();
        assert_eq!(updated.status(), OrderStatus::Validated);
        assert_eq!(updated.version(), 2);
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_on_missing_aggregate_is_not_found() {
        let store = MemoryStore::new();
        let repo = repo(&store);
        let ctx = CorrelationContext::new();
        let err = repo
            .update("ORD-404", &ctx, |o: &mut Order| o.validate(&SystemClock))
            .await
            .unwrap_err();
        assert_eq!(err.code, wharf_types::ErrorCode::ResourceNotFound);
    }
}
