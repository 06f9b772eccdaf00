//! Wiring: stores, bus, relay, consumers, projections and the workflow
//! engine assembled into one service lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use wharf_bus_core::InMemoryBus;
use wharf_consumer::{ConsumerWorker, EventHandler};
use wharf_fulfillment::{
    register as register_fulfillment, root_workflow_id, AggregateRepository, FulfillmentDeps,
    FulfillmentInput,
};
use wharf_projection::{
    InventoryBySkuProjection, OrdersByCustomerProjection, ProjectionEngine,
};
use wharf_relay::OutboxRelay;
use wharf_resilience::BreakerRegistry;
use wharf_store_core::{
    AggregateStore, ConsumerDedupStore, HttpIdempotencyStore, OffsetStore, OutboxStore,
};
use wharf_store_memory::MemoryStore;
use wharf_store_sqlite::SqliteStore;
use wharf_types::{Clock, SystemClock, WorkflowId};
use wharf_workflow::{
    InMemoryHistoryStore, WorkflowEngine, WorkflowEngineConfig, WorkflowStatus,
};

use crate::config::{RuntimeConfig, StorageDriver};
use crate::idempotency::HttpIdempotencyGate;

struct Stores {
    aggregates: Arc<dyn AggregateStore>,
    outbox: Arc<dyn OutboxStore>,
    dedup: Arc<dyn ConsumerDedupStore>,
    http: Arc<dyn HttpIdempotencyStore>,
    offsets: Arc<dyn OffsetStore>,
}

impl Stores {
    async fn build(config: &RuntimeConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.storage.dedup_ttl_secs);
        match config.storage.driver {
            StorageDriver::Memory => {
                let store = MemoryStore::new().with_dedup_ttl(ttl);
                Ok(Self {
                    aggregates: Arc::new(store.clone()),
                    outbox: Arc::new(store.clone()),
                    dedup: Arc::new(store.clone()),
                    http: Arc::new(store.clone()),
                    offsets: Arc::new(store),
                })
            }
            StorageDriver::Sqlite => {
                let store = SqliteStore::open(&config.storage.sqlite_path)
                    .await
                    .with_context(|| {
                        format!("opening sqlite store at {}", config.storage.sqlite_path)
                    })?
                    .with_dedup_ttl(ttl);
                Ok(Self {
                    aggregates: Arc::new(store.clone()),
                    outbox: Arc::new(store.clone()),
                    dedup: Arc::new(store.clone()),
                    http: Arc::new(store.clone()),
                    offsets: Arc::new(store),
                })
            }
        }
    }
}

/// One service instance: everything between the HTTP edge and the bus.
pub struct ServiceRuntime {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<InMemoryBus>,
    stores: Stores,
    repository: AggregateRepository,
    engine: Arc<WorkflowEngine>,
    breakers: Arc<BreakerRegistry>,
    inventory_view: Arc<InventoryBySkuProjection>,
    orders_view: Arc<OrdersByCustomerProjection>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: Mutex<bool>,
}

impl ServiceRuntime {
    /// Build a runtime from configuration. Background loops do not run
    /// until [`start`](Self::start).
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = Stores::build(&config).await?;
        let bus = Arc::new(InMemoryBus::new(config.bus_buffer));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));

        let repository = AggregateRepository::new(
            Arc::clone(&stores.aggregates),
            config.service_name.clone(),
            Arc::clone(&clock),
        );

        let engine = WorkflowEngine::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::clone(&clock),
            WorkflowEngineConfig::default(),
        );
        register_fulfillment(&engine, Arc::new(FulfillmentDeps::new(repository.clone())));

        Ok(Self {
            config,
            clock,
            bus,
            stores,
            repository,
            engine,
            breakers,
            inventory_view: Arc::new(InventoryBySkuProjection::new()),
            orders_view: Arc::new(OrdersByCustomerProjection::new()),
            handlers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            is_running: Mutex::new(false),
        })
    }

    /// Register an event consumer. Must happen before `start`.
    pub async fn add_consumer(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.lock().await.push(handler);
    }

    /// Spawn the relay, consumer workers and projection engine.
    pub async fn start(&self) -> Result<()> {
        let mut is_running = self.is_running.lock().await;
        if *is_running {
            return Ok(());
        }
        *is_running = true;

        let mut tasks = self.tasks.lock().await;

        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&self.stores.outbox),
            self.bus_handle(),
            Arc::clone(&self.clock),
            self.breakers.breaker("bus"),
            self.config.relay.to_relay_config(),
        ));
        tasks.push(relay.spawn(self.cancel.clone()));

        for handler in self.handlers.lock().await.iter() {
            let worker = Arc::new(ConsumerWorker::new(
                Arc::clone(handler),
                self.bus_handle(),
                Arc::clone(&self.stores.dedup),
                Arc::clone(&self.stores.offsets),
                Arc::clone(&self.clock),
                self.config.consumer.to_consumer_config(),
            ));
            tasks.push(worker.spawn(self.cancel.clone()));
        }

        // Dedup janitor: drops records past their TTL once an hour.
        let dedup = Arc::clone(&self.stores.dedup);
        let clock = Arc::clone(&self.clock);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60 * 60)) => {
                        match dedup.purge_expired(clock.now()).await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "purged expired dedup records"),
                            Err(err) => tracing::warn!(error = %err, "dedup purge failed"),
                        }
                    }
                }
            }
        }));

        let mut projections =
            ProjectionEngine::new(self.bus_handle(), Arc::clone(&self.stores.offsets));
        let inventory: Arc<dyn wharf_projection::Projection> =
            Arc::clone(&self.inventory_view) as Arc<dyn wharf_projection::Projection>;
        let orders: Arc<dyn wharf_projection::Projection> =
            Arc::clone(&self.orders_view) as Arc<dyn wharf_projection::Projection>;
        projections.register(inventory);
        projections.register(orders);
        tasks.push(Arc::new(projections).spawn(self.cancel.clone()));

        info!(
            service = %self.config.service_name,
            consumers = self.handlers.lock().await.len(),
            "service runtime started"
        );
        Ok(())
    }

    /// Cancel every loop and wait for current batches to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let mut is_running = self.is_running.lock().await;
        if !*is_running {
            return Ok(());
        }
        *is_running = false;
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        info!(service = %self.config.service_name, "service runtime stopped");
        Ok(())
    }

    /// Kick off the fulfillment saga for an order.
    pub async fn start_fulfillment(&self, input: &FulfillmentInput) -> Result<WorkflowId> {
        let id = root_workflow_id(&input.order_id);
        self.engine
            .start(
                id.as_str(),
                "order_fulfillment",
                serde_json::to_value(input)?,
            )
            .await?;
        Ok(id)
    }

    /// Deliver an operator signal to a workflow instance.
    pub async fn signal(
        &self,
        workflow_id: &str,
        channel: &str,
        payload: serde_json::Value,
        delivery_id: &str,
    ) -> Result<()> {
        self.engine
            .signal(workflow_id, channel, payload, delivery_id)
            .await?;
        Ok(())
    }

    /// Wait for a workflow instance to park.
    pub async fn await_workflow(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        Ok(self.engine.await_instance(workflow_id).await?)
    }

    /// The write-side repository.
    pub fn repository(&self) -> &AggregateRepository {
        &self.repository
    }

    /// The workflow engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// The process-local bus.
    pub fn bus(&self) -> &Arc<InMemoryBus> {
        &self.bus
    }

    /// The inventory-by-SKU read model.
    pub fn inventory_view(&self) -> &Arc<InventoryBySkuProjection> {
        &self.inventory_view
    }

    /// The orders-by-customer read model.
    pub fn orders_view(&self) -> &Arc<OrdersByCustomerProjection> {
        &self.orders_view
    }

    /// Gate for mutating HTTP handlers.
    pub fn idempotency_gate(&self) -> HttpIdempotencyGate {
        HttpIdempotencyGate::new(
            Arc::clone(&self.stores.http),
            Arc::clone(&self.clock),
            self.config.service_name.clone(),
            Duration::from_secs(self.config.idempotency_lock_secs),
        )
    }

    /// Active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn bus_handle(&self) -> Arc<dyn wharf_bus_core::EventBus> {
        Arc::clone(&self.bus) as Arc<dyn wharf_bus_core::EventBus>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_domain::Order;
    use wharf_events::OrderLine;
    use wharf_types::{CorrelationContext, CustomerId, OrderId, Priority};

    async fn runtime() -> ServiceRuntime {
        ServiceRuntime::new(RuntimeConfig {
            relay: crate::config::RelaySettings {
                poll_interval_ms: 10,
                ..Default::default()
            },
            ..RuntimeConfig::default()
        })
        .await
        .unwrap()
    }

    fn sample_order(id: &str) -> Order {
        Order::create(
            OrderId::from(id),
            CustomerId::from("CUST-7"),
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
    async fn start_is_idempotent_and_shutdown_joins() {
        let runtime = runtime().await;
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn committed_writes_flow_to_the_read_model() {
        let runtime = runtime().await;
        runtime.start().await.unwrap();

        let correlation = CorrelationContext::new();
        let mut order = sample_order("ORD-77");
        runtime
            .repository()
            .save(&mut order, &correlation)
            .await
            .unwrap();

        // Relay publishes, projector folds; quiesce within a bounded wait.
        let mut found = false;
        for _ in 0..200 {
            if runtime.orders_view().order("ORD-77").is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(found, "projection never caught up");

        let orders = runtime.orders_view().for_customer("CUST-7");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "received");
        assert_eq!(orders[0].item_count, 2);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn gate_caches_through_the_configured_store() {
        let runtime = runtime().await;
        let gate = runtime.idempotency_gate();
        let body = b"{}";

        let first = gate
            .execute("key-9", None, body, || async { Ok((202, b"queued".to_vec())) })
            .await
            .unwrap();
        let second = gate
            .execute("key-9", None, body, || async {
                panic!("handler must not run twice")
            })
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.body, b"queued");
    }
}
