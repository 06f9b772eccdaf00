//! End-to-end fulfillment scenarios over the memory driver: the saga drives
//! real aggregates, stages real outbox rows, and the relay publishes them to
//! the in-memory bus.

use std::sync::Arc;

use wharf_bus_core::InMemoryBus;
use wharf_domain::{Inventory, Order, OrderStatus};
use wharf_events::{DomainEventPayload, OrderLine, PickedItem, Topic};
use wharf_fulfillment::{
    channels, register, root_workflow_id, AggregateRepository, FulfillmentDeps, FulfillmentInput,
    FulfillmentSummary, ItemPickedSignal, PackageSealedSignal, PackerAssignedSignal,
    PackingCompleteSignal, PickExceptionSignal, PickTask, PickTaskStatus, PickingCompleteSignal,
    RouteTemplate, ShipConfirmedSignal, WaveAssignedSignal, WorkerAssignedSignal,
};
use wharf_relay::{OutboxRelay, RelayConfig};
use wharf_resilience::{BreakerConfig, CircuitBreaker};
use wharf_store_memory::MemoryStore;
use wharf_types::{
    CorrelationContext, CustomerId, LocationId, OrderId, Priority, SkuId, SystemClock, WaveId,
};
use wharf_workflow::{
    InMemoryHistoryStore, WorkflowEngine, WorkflowEngineConfig, WorkflowStatus,
};

struct Harness {
    store: MemoryStore,
    repo: AggregateRepository,
    engine: Arc<WorkflowEngine>,
    bus: InMemoryBus,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let repo = AggregateRepository::new(
            Arc::new(store.clone()),
            "fulfillment-service",
            Arc::new(SystemClock),
        );
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(SystemClock),
            WorkflowEngineConfig::default(),
        );
        register(&engine, Arc::new(FulfillmentDeps::new(repo.clone())));
        Self {
            store,
            repo,
            engine,
            bus: InMemoryBus::default(),
        }
    }

    async fn seed_inventory(&self, sku: &str, location: &str, quantity: u32) {
        let mut inventory = Inventory::new(SkuId::from(sku));
        inventory
            .receive(LocationId::from(location), quantity, &SystemClock)
            .unwrap();
        self.repo
            .save(&mut inventory, &CorrelationContext::new())
            .await
            .unwrap();
    }

    async fn seed_order(
        &self,
        id: &str,
        priority: Priority,
        lines: Vec<OrderLine>,
    ) -> (FulfillmentInput, CorrelationContext) {
        let correlation = CorrelationContext::new().with_order(OrderId::from(id));
        let mut order = Order::create(
            OrderId::from(id),
            CustomerId::from("CUST-1"),
            priority,
            lines,
            &SystemClock,
        )
        .unwrap();
        let item_count = order.item_count();
        let multi_zone = order.is_multi_zone();
        self.repo.save(&mut order, &correlation).await.unwrap();
        (
            FulfillmentInput {
                order_id: OrderId::from(id),
                priority,
                item_count,
                multi_zone,
                correlation: correlation.clone(),
            },
            correlation,
        )
    }

    async fn signal<T: serde::Serialize>(&self, workflow: &str, channel: &str, payload: &T, delivery: &str) {
        self.engine
            .signal(workflow, channel, serde_json::to_value(payload).unwrap(), delivery)
            .await
            .unwrap();
    }

    async fn run_to_completion(&self, input: &FulfillmentInput) -> WorkflowStatus {
        let id = root_workflow_id(&input.order_id);
        self.engine
            .start(
                id.as_str(),
                "order_fulfillment",
                serde_json::to_value(input).unwrap(),
            )
            .await
            .unwrap();
        self.engine.await_instance(id.as_str()).await.unwrap()
    }

    async fn drain_relay(&self) {
        let relay = OutboxRelay::new(
            Arc::new(self.store.clone()),
            Arc::new(self.bus.clone()),
            Arc::new(SystemClock),
            Arc::new(CircuitBreaker::new("bus", BreakerConfig::default())),
            RelayConfig::default(),
        );
        while relay.drain_once().await.unwrap() > 0 {}
    }

    async fn order_event_types_for(&self, order_id: &str) -> Vec<String> {
        self.bus
            .records(Topic::Orders.as_str())
            .await
            .into_iter()
            .filter(|r| r.key == order_id)
            .map(|r| match r.envelope.payload().unwrap() {
                DomainEventPayload::Order(e) => e.event_type().to_owned(),
                other => panic!("unexpected payload on orders topic: {other:?}"),
            })
            .collect()
    }
}

fn line(sku: &str, quantity: u32, zone: Option<&str>) -> OrderLine {
    OrderLine {
        sku: SkuId::from(sku),
        quantity,
        zone: zone.map(str::to_owned),
    }
}

fn picked(sku: &str, location: &str, quantity: u32) -> PickedItem {
    PickedItem {
        sku: SkuId::from(sku),
        location_id: LocationId::from(location),
        quantity,
        tote_id: "TOTE-1".to_owned(),
    }
}

async fn buffer_packing_signals(h: &Harness, route: &str) {
    let packing = format!("packing-{route}");
    h.signal(
        &packing,
        channels::PACKER_ASSIGNED,
        &PackerAssignedSignal {
            packer_id: "P-1".to_owned(),
            station: "PACK-3".to_owned(),
        },
        &format!("{packing}-packer"),
    )
    .await;
    h.signal(
        &packing,
        channels::PACKAGE_SEALED,
        &PackageSealedSignal {
            package_id: "PKG-9".to_owned(),
            weight: 1250,
        },
        &format!("{packing}-sealed"),
    )
    .await;
    h.signal(
        &packing,
        channels::PACKING_COMPLETE,
        &PackingCompleteSignal { success: true },
        &format!("{packing}-complete"),
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn s1_happy_path_standard_priority() {
    let h = Harness::new();
    h.seed_inventory("SKU-A", "A-01", 10).await;
    h.seed_inventory("SKU-B", "A-01", 5).await;
    let (input, correlation) = h
        .seed_order(
            "ORD-1",
            Priority::Standard,
            vec![line("SKU-A", 1, None), line("SKU-B", 1, None)],
        )
        .await;

    // Everything the floor will say, buffered ahead of time.
    h.signal(
        "planning-ORD-1",
        channels::WAVE_ASSIGNED,
        &WaveAssignedSignal {
            wave_id: WaveId::from("WV-1"),
            scheduled_start: chrono::Utc::now() + chrono::Duration::hours(1),
        },
        "wave-1",
    )
    .await;
    let picking = "picking-route-ORD-1";
    h.signal(
        picking,
        channels::WORKER_ASSIGNED,
        &WorkerAssignedSignal {
            worker_id: "W-1".to_owned(),
            tote_id: "TOTE-1".to_owned(),
        },
        "worker-1",
    )
    .await;
    h.signal(
        picking,
        channels::ITEM_PICKED,
        &ItemPickedSignal {
            sku: SkuId::from("SKU-A"),
            location_id: LocationId::from("A-01"),
            quantity: 1,
            tote_id: "TOTE-1".to_owned(),
        },
        "pick-1",
    )
    .await;
    h.signal(
        picking,
        channels::ITEM_PICKED,
        &ItemPickedSignal {
            sku: SkuId::from("SKU-B"),
            location_id: LocationId::from("A-01"),
            quantity: 1,
            tote_id: "TOTE-1".to_owned(),
        },
        "pick-2",
    )
    .await;
    h.signal(
        picking,
        channels::PICKING_COMPLETE,
        &PickingCompleteSignal {
            success: true,
            picked: vec![picked("SKU-A", "A-01", 1), picked("SKU-B", "A-01", 1)],
        },
        "pick-done",
    )
    .await;
    buffer_packing_signals(&h, "route-ORD-1").await;
    h.signal(
        "shipping-ORD-1",
        channels::SHIP_CONFIRMED,
        &ShipConfirmedSignal {
            shipped_at: chrono::Utc::now(),
            estimated_delivery: None,
        },
        "ship-1",
    )
    .await;

    let status = h.run_to_completion(&input).await;
    let summary: FulfillmentSummary = match status {
        WorkflowStatus::Completed { result } => serde_json::from_value(result).unwrap(),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(summary.template, RouteTemplate::PickPack);
    assert_eq!(summary.tracking_number, "TRK-ship-ORD-1");

    // Write model: order completed, stock decremented, nothing reserved.
    let order: Order = h.repo.load("ORD-1").await.unwrap().unwrap();
    assert_eq!(order.status(), OrderStatus::Completed);
    let sku_a: Inventory = h.repo.load("SKU-A").await.unwrap().unwrap();
    assert_eq!(sku_a.quantity(), 9);
    assert_eq!(sku_a.reserved(), 0);
    let sku_b: Inventory = h.repo.load("SKU-B").await.unwrap().unwrap();
    assert_eq!(sku_b.quantity(), 4);

    // Event pipeline: per-order stream in command order, one received, one
    // shipped, correlation id threaded end to end.
    h.drain_relay().await;
    let types = h.order_event_types_for("ORD-1").await;
    assert_eq!(
        types,
        vec![
            "order.received",
            "order.validated",
            "order.assigned_to_wave",
            "order.picking_started",
            "order.packing_started",
            "order.shipped",
            "order.completed",
        ]
    );
    let records = h.bus.records(Topic::Orders.as_str()).await;
    assert!(records
        .iter()
        .filter(|r| r.key == "ORD-1")
        .all(|r| r.envelope.wmscorrelationid == correlation.correlation_id));
}

#[tokio::test(start_paused = true)]
async fn s2_wave_timeout_cancels_and_releases() {
    let h = Harness::new();
    h.seed_inventory("SKU-A", "A-01", 10).await;
    let (input, _) = h
        .seed_order("ORD-2", Priority::SameDay, vec![line("SKU-A", 2, None)])
        .await;

    // No wave planner signal: the 30-minute same-day timer fires.
    let status = h.run_to_completion(&input).await;
    match status {
        WorkflowStatus::Failed { reason } => assert!(reason.contains("planning-ORD-2")),
        other => panic!("expected failure, got {other:?}"),
    }

    let order: Order = h.repo.load("ORD-2").await.unwrap().unwrap();
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason(), Some("wave_timeout"));

    // Compensation completeness: the allocation was released.
    let inventory: Inventory = h.repo.load("SKU-A").await.unwrap().unwrap();
    assert_eq!(inventory.reserved(), 0);
    assert_eq!(inventory.quantity(), 10);

    h.drain_relay().await;
    let types = h.order_event_types_for("ORD-2").await;
    assert_eq!(types.last().map(String::as_str), Some("order.cancelled"));
}

#[tokio::test(start_paused = true)]
async fn s4_pick_exception_resolved_from_alternate_location() {
    let h = Harness::new();
    // Two locations so the exception has somewhere to go.
    let mut inventory = Inventory::new(SkuId::from("SKU-X"));
    inventory
        .receive(LocationId::from("A-01"), 5, &SystemClock)
        .unwrap();
    inventory
        .receive(LocationId::from("B-02"), 5, &SystemClock)
        .unwrap();
    h.repo
        .save(&mut inventory, &CorrelationContext::new())
        .await
        .unwrap();

    let (input, _) = h
        .seed_order("ORD-4", Priority::Standard, vec![line("SKU-X", 1, None)])
        .await;

    h.signal(
        "planning-ORD-4",
        channels::WAVE_ASSIGNED,
        &WaveAssignedSignal {
            wave_id: WaveId::from("WV-4"),
            scheduled_start: chrono::Utc::now(),
        },
        "wave-4",
    )
    .await;
    let picking = "picking-route-ORD-4";
    h.signal(
        picking,
        channels::WORKER_ASSIGNED,
        &WorkerAssignedSignal {
            worker_id: "W-2".to_owned(),
            tote_id: "TOTE-4".to_owned(),
        },
        "worker-4",
    )
    .await;
    // The slot is empty; the saga reroutes, then the pick resumes.
    h.signal(
        picking,
        channels::PICK_EXCEPTION,
        &PickExceptionSignal {
            sku: SkuId::from("SKU-X"),
            reason: "empty_location".to_owned(),
            available: 0,
        },
        "exc-1",
    )
    .await;
    h.signal(
        picking,
        channels::ITEM_PICKED,
        &ItemPickedSignal {
            sku: SkuId::from("SKU-X"),
            location_id: LocationId::from("B-02"),
            quantity: 1,
            tote_id: "TOTE-4".to_owned(),
        },
        "pick-4",
    )
    .await;
    h.signal(
        picking,
        channels::PICKING_COMPLETE,
        &PickingCompleteSignal {
            success: true,
            picked: vec![picked("SKU-X", "B-02", 1)],
        },
        "pick-done-4",
    )
    .await;
    buffer_packing_signals(&h, "route-ORD-4").await;
    // No shipConfirmed: the shipping stage auto-confirms after its timer.

    let status = h.run_to_completion(&input).await;
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    // Exactly one deduction despite the exception rerun.
    let inventory: Inventory = h.repo.load("SKU-X").await.unwrap().unwrap();
    assert_eq!(inventory.quantity(), 9);
    assert_eq!(inventory.reserved(), 0);

    // The exception trail is on the picking topic.
    h.drain_relay().await;
    let picking_types: Vec<String> = h
        .bus
        .records(Topic::Picking.as_str())
        .await
        .into_iter()
        .map(|r| match r.envelope.payload().unwrap() {
            DomainEventPayload::Picking(e) => e.event_type().to_owned(),
            other => panic!("unexpected payload: {other:?}"),
        })
        .collect();
    assert!(picking_types.contains(&"picking.exception_raised".to_owned()));
    assert!(picking_types.contains(&"picking.exception_resolved".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn s6_multi_zone_consolidation_event_order() {
    let h = Harness::new();
    h.seed_inventory("SKU-A", "A-01", 10).await;
    h.seed_inventory("SKU-B", "B-01", 10).await;
    h.seed_inventory("SKU-C", "C-01", 10).await;
    let (input, _) = h
        .seed_order(
            "ORD-6",
            Priority::NextDay,
            vec![
                line("SKU-A", 1, Some("A")),
                line("SKU-B", 1, Some("B")),
                line("SKU-C", 1, Some("C")),
            ],
        )
        .await;
    assert!(input.multi_zone);

    h.signal(
        "planning-ORD-6",
        channels::WAVE_ASSIGNED,
        &WaveAssignedSignal {
            wave_id: WaveId::from("WV-6"),
            scheduled_start: chrono::Utc::now(),
        },
        "wave-6",
    )
    .await;
    let picking = "picking-route-ORD-6";
    h.signal(
        picking,
        channels::WORKER_ASSIGNED,
        &WorkerAssignedSignal {
            worker_id: "W-6".to_owned(),
            tote_id: "TOTE-6".to_owned(),
        },
        "worker-6",
    )
    .await;
    for (i, (sku, loc)) in [("SKU-A", "A-01"), ("SKU-B", "B-01"), ("SKU-C", "C-01")]
        .iter()
        .enumerate()
    {
        h.signal(
            picking,
            channels::ITEM_PICKED,
            &ItemPickedSignal {
                sku: SkuId::from(*sku),
                location_id: LocationId::from(*loc),
                quantity: 1,
                tote_id: format!("TOTE-{i}"),
            },
            &format!("pick-6-{i}"),
        )
        .await;
    }
    h.signal(
        picking,
        channels::PICKING_COMPLETE,
        &PickingCompleteSignal {
            success: true,
            picked: vec![
                picked("SKU-A", "A-01", 1),
                picked("SKU-B", "B-01", 1),
                picked("SKU-C", "C-01", 1),
            ],
        },
        "pick-done-6",
    )
    .await;
    let consolidation = "consolidation-route-ORD-6";
    h.signal(
        consolidation,
        channels::CONSOLIDATION_COMPLETE,
        &wharf_fulfillment::ConsolidationCompleteSignal { success: true },
        "consolidation-6",
    )
    .await;
    buffer_packing_signals(&h, "route-ORD-6").await;
    h.signal(
        "shipping-ORD-6",
        channels::SHIP_CONFIRMED,
        &ShipConfirmedSignal {
            shipped_at: chrono::Utc::now(),
            estimated_delivery: None,
        },
        "ship-6",
    )
    .await;

    let status = h.run_to_completion(&input).await;
    let summary: FulfillmentSummary = match status {
        WorkflowStatus::Completed { result } => serde_json::from_value(result).unwrap(),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(summary.template, RouteTemplate::PickConsolidatePack);

    h.drain_relay().await;
    let types = h.order_event_types_for("ORD-6").await;
    assert_eq!(
        types,
        vec![
            "order.received",
            "order.validated",
            "order.assigned_to_wave",
            "order.picking_started",
            "order.consolidation_started",
            "order.packing_started",
            "order.shipped",
            "order.completed",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_picking_unwinds_everything() {
    let h = Harness::new();
    h.seed_inventory("SKU-A", "A-01", 10).await;
    let (input, _) = h
        .seed_order("ORD-9", Priority::Standard, vec![line("SKU-A", 1, None)])
        .await;

    h.signal(
        "planning-ORD-9",
        channels::WAVE_ASSIGNED,
        &WaveAssignedSignal {
            wave_id: WaveId::from("WV-9"),
            scheduled_start: chrono::Utc::now(),
        },
        "wave-9",
    )
    .await;
    h.signal(
        "picking-route-ORD-9",
        channels::WORKER_ASSIGNED,
        &WorkerAssignedSignal {
            worker_id: "W-9".to_owned(),
            tote_id: "TOTE-9".to_owned(),
        },
        "worker-9",
    )
    .await;
    // No further signals: the saga parks inside the picking loop.

    let root = root_workflow_id(&input.order_id);
    h.engine
        .start(root.as_str(), "order_fulfillment", serde_json::to_value(&input).unwrap())
        .await
        .unwrap();

    // Wait for picking to actually start before cancelling.
    loop {
        let order: Order = h.repo.load("ORD-9").await.unwrap().unwrap();
        if order.status() == OrderStatus::Picking {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    h.engine.cancel(root.as_str(), "customer cancelled").await;

    let status = h.engine.await_instance(root.as_str()).await.unwrap();
    match status {
        WorkflowStatus::Cancelled { reason } => assert_eq!(reason, "customer cancelled"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    // Children compensate in their own tasks; wait for them to park.
    let _ = h.engine.await_instance("wes-ORD-9").await.unwrap();
    let _ = h.engine.await_instance("picking-route-ORD-9").await.unwrap();

    // Compensation completeness: reservation released, pick task cancelled.
    let inventory: Inventory = h.repo.load("SKU-A").await.unwrap().unwrap();
    assert_eq!(inventory.reserved(), 0);
    let task: PickTask = h.repo.load("pick-route-ORD-9").await.unwrap().unwrap();
    assert_eq!(task.status(), PickTaskStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn validation_failure_terminates_without_side_effects() {
    let h = Harness::new();
    // Order exists but is already cancelled: validate hits a conflict.
    let correlation = CorrelationContext::new();
    let mut order = Order::create(
        OrderId::from("ORD-8"),
        CustomerId::from("CUST-1"),
        Priority::Standard,
        vec![line("SKU-A", 1, None)],
        &SystemClock,
    )
    .unwrap();
    order.cancel("seed", &SystemClock).unwrap();
    h.repo.save(&mut order, &correlation).await.unwrap();

    let input = FulfillmentInput {
        order_id: OrderId::from("ORD-8"),
        priority: Priority::Standard,
        item_count: 1,
        multi_zone: false,
        correlation,
    };
    let status = h.run_to_completion(&input).await;
    assert!(matches!(status, WorkflowStatus::Failed { .. }));
    // Nothing was allocated, so there is nothing to unwind.
    assert!(h.repo.load::<Inventory>("SKU-A").await.unwrap().is_none());
}
