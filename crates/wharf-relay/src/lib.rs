#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-relay** – Outbox relay worker for Wharf.
//!
//! A long-lived background task per service instance. Each cycle it claims
//! the oldest unpublished outbox rows under a short lease, publishes them to
//! their topics keyed by aggregate id, and marks the outcome. A row that
//! keeps failing is parked in place at `max_attempts` for inspection; one
//! failing row never blocks other aggregates' events. Publishing goes
//! through a circuit breaker so a dead broker fails fast instead of burning
//! row attempts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wharf_bus_core::EventBus;
use wharf_events::CloudEvent;
use wharf_resilience::{classify, CircuitBreaker, ErrorCategory};
use wharf_store_core::OutboxStore;
use wharf_types::Clock;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pause between polls when the outbox is drained.
    pub poll_interval: Duration,
    /// Maximum rows claimed per cycle.
    pub batch_size: usize,
    /// Row lease duration; a crashed relay's claims lapse after this.
    pub lease: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            lease: Duration::from_secs(30),
        }
    }
}

/// Background worker draining the outbox onto the event bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    breaker: Arc<CircuitBreaker>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay over `store` publishing to `bus`.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        breaker: Arc<CircuitBreaker>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            breaker,
            config,
        }
    }

    /// Claim and publish one batch. Returns how many rows were published.
    ///
    /// Exposed separately from the loop so tests and drain-on-shutdown can
    /// drive cycles deterministically.
    pub async fn drain_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.lease, now)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        debug!(rows = batch.len(), "claimed outbox batch");

        let mut published = 0;
        for row in batch {
            let envelope = match CloudEvent::from_bytes(&row.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    // An unparseable row can never publish; record the error
                    // so it walks to the parked state and surfaces in
                    // dead_letters().
                    warn!(row = %row.id, error = %err, "outbox row payload is invalid");
                    self.store
                        .mark_failed(row.id, &err.to_string(), self.clock.now())
                        .await?;
                    continue;
                }
            };

            let topic = row.topic.clone();
            let key = row.aggregate_id.clone();
            let bus = Arc::clone(&self.bus);
            let result = self
                .breaker
                .call(|| async move { bus.publish(&topic, &key, envelope).await })
                .await;

            match result {
                Ok(_offset) => {
                    self.store.mark_published(row.id, self.clock.now()).await?;
                    published += 1;
                }
                Err(err) if classify(&err) == ErrorCategory::CircuitOpen => {
                    // The broker is down; leave the lease intact so the rows
                    // retry after it lapses without consuming attempts.
                    warn!(row = %row.id, "bus circuit open, abandoning cycle");
                    break;
                }
                Err(err) => {
                    warn!(row = %row.id, error = %err, "publish failed");
                    self.store
                        .mark_failed(row.id, &format!("{err:#}"), self.clock.now())
                        .await?;
                }
            }
        }
        Ok(published)
    }

    /// Spawn the poll loop. The task finishes its current batch after
    /// `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_ms = self.config.poll_interval.as_millis() as u64,
                batch = self.config.batch_size,
                "outbox relay started"
            );
            loop {
                match self.drain_once().await {
                    Ok(0) => {}
                    Ok(n) => debug!(published = n, "relay cycle complete"),
                    Err(err) => warn!(error = %err, "relay cycle failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
            info!("outbox relay stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use wharf_bus_core::InMemoryBus;
    use wharf_events::{
        AggregateType, CloudEvent, DomainEvent, DomainEventPayload, OrderEvent, Topic,
    };
    use wharf_resilience::BreakerConfig;
    use wharf_store_core::{AggregateDoc, AggregateStore, OutboxRow};
    use wharf_store_memory::MemoryStore;
    use wharf_types::{CorrelationContext, SystemClock};

    fn staged_row(store_event: &DomainEvent, created_at: chrono::DateTime<Utc>) -> OutboxRow {
        let envelope = CloudEvent::from_domain_event(
            "order-service",
            store_event,
            &CorrelationContext::new(),
        )
        .unwrap();
        OutboxRow::new(
            envelope.id,
            store_event.aggregate_id.clone(),
            store_event.aggregate_type,
            store_event.topic().as_str().to_owned(),
            store_event.event_type().to_owned(),
            envelope.to_bytes().unwrap(),
            created_at,
        )
    }

    fn order_event(aggregate_id: &str, payload: OrderEvent) -> DomainEvent {
        DomainEvent {
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: AggregateType::Order,
            occurred_at: Utc::now(),
            payload: DomainEventPayload::Order(payload),
        }
    }

    async fn stage(store: &MemoryStore, version: u64, rows: Vec<OutboxRow>) {
        let doc = AggregateDoc {
            aggregate_id: rows[0].aggregate_id.clone(),
            aggregate_type: AggregateType::Order,
            version,
            state: serde_json::json!({}),
            updated_at: Utc::now(),
        };
        store.save(doc, rows).await.unwrap();
    }

    fn relay(store: &MemoryStore, bus: &InMemoryBus) -> OutboxRelay {
        OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(SystemClock),
            Arc::new(CircuitBreaker::new("bus", BreakerConfig::default())),
            RelayConfig::default(),
        )
    }

    #[tokio::test]
    async fn publishes_rows_in_created_order() {
        let store = MemoryStore::new();
        let bus = InMemoryBus::default();
        let now = Utc::now();
        let first = staged_row(
            &order_event("ORD-1", OrderEvent::Validated),
            now - chrono::Duration::seconds(2),
        );
        let second = staged_row(&order_event("ORD-1", OrderEvent::PickingStarted), now);
        stage(&store, 1, vec![first.clone(), second.clone()]).await;

        let relay = relay(&store, &bus);
        assert_eq!(relay.drain_once().await.unwrap(), 2);

        let records = bus.records(Topic::Orders.as_str()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].envelope.id, first.id);
        assert_eq!(records[1].envelope.id, second.id);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        // Nothing left to publish.
        assert_eq!(relay.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn envelope_id_stable_across_republish() {
        // Simulates a relay crash between bus ack and mark_published: the
        // same row publishes twice with the same envelope id, which is what
        // lets consumers dedup.
        let store = MemoryStore::new();
        let bus = InMemoryBus::default();
        let row = staged_row(&order_event("ORD-1", OrderEvent::Validated), Utc::now());
        stage(&store, 1, vec![row.clone()]).await;

        // First delivery reached the bus, but the process died before
        // mark_published ran: the row is still unpublished in the store.
        let envelope = CloudEvent::from_bytes(&row.payload).unwrap();
        bus.publish(&row.topic, &row.aggregate_id, envelope)
            .await
            .unwrap();

        // The restarted relay claims the row and publishes it again.
        let relay = relay(&store, &bus);
        assert_eq!(relay.drain_once().await.unwrap(), 1);

        let records = bus.records(Topic::Orders.as_str()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].envelope.id, records[1].envelope.id);
    }

    #[tokio::test]
    async fn invalid_payload_walks_to_dead_letter() {
        let store = MemoryStore::new();
        let bus = InMemoryBus::default();
        let mut row = staged_row(&order_event("ORD-1", OrderEvent::Validated), Utc::now());
        row.payload = b"not json".to_vec();
        stage(&store, 1, vec![row.clone()]).await;

        let relay = relay(&store, &bus);
        for _ in 0..wharf_store_core::DEFAULT_MAX_ATTEMPTS {
            relay.drain_once().await.unwrap();
        }
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, row.id);
        assert!(bus.records(Topic::Orders.as_str()).await.is_empty());
    }

    #[tokio::test]
    async fn loop_shuts_down_on_cancel() {
        let store = MemoryStore::new();
        let bus = InMemoryBus::default();
        let relay = Arc::new(OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(SystemClock),
            Arc::new(CircuitBreaker::new("bus", BreakerConfig::default())),
            RelayConfig {
                poll_interval: Duration::from_millis(10),
                ..RelayConfig::default()
            },
        ));
        let cancel = CancellationToken::new();
        let handle = relay.spawn(cancel.clone());

        stage(
            &store,
            1,
            vec![staged_row(&order_event("ORD-1", OrderEvent::Validated), Utc::now())],
        )
        .await;
        // Give the loop a few cycles to pick the row up.
        for _ in 0..50 {
            if bus.topic_len(Topic::Orders.as_str()).await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(bus.topic_len(Topic::Orders.as_str()).await, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
