//! Typed domain events, one closed enumeration per bounded context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wharf_types::{CustomerId, LocationId, OrderId, Priority, SkuId, WaveId};

use crate::topics::Topic;

//─────────────────────────────
//  Aggregate taxonomy
//─────────────────────────────

/// Kind of write-model aggregate an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    /// Customer order aggregate.
    Order,
    /// Picking wave aggregate.
    Wave,
    /// Per-SKU inventory ledger aggregate.
    Inventory,
    /// Billing invoice aggregate.
    Invoice,
    /// Picking task created for a route.
    PickTask,
    /// Put-wall sorting task.
    WallTask,
    /// Warehouse execution route instance.
    WesRoute,
    /// Outbound shipment.
    Shipment,
}

impl AggregateType {
    /// Canonical snake-case name, as stored in outbox rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Order => "order",
            AggregateType::Wave => "wave",
            AggregateType::Inventory => "inventory",
            AggregateType::Invoice => "invoice",
            AggregateType::PickTask => "pick_task",
            AggregateType::WallTask => "wall_task",
            AggregateType::WesRoute => "wes_route",
            AggregateType::Shipment => "shipment",
        }
    }
}

impl std::str::FromStr for AggregateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(AggregateType::Order),
            "wave" => Ok(AggregateType::Wave),
            "inventory" => Ok(AggregateType::Inventory),
            "invoice" => Ok(AggregateType::Invoice),
            "pick_task" => Ok(AggregateType::PickTask),
            "wall_task" => Ok(AggregateType::WallTask),
            "wes_route" => Ok(AggregateType::WesRoute),
            "shipment" => Ok(AggregateType::Shipment),
            other => Err(format!("unknown aggregate type {other:?}")),
        }
    }
}

/// Event domain, the unit the topic registry and wire type prefix key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDomain {
    /// Order lifecycle events.
    Orders,
    /// Wave planning events.
    Waves,
    /// Inventory ledger events.
    Inventory,
    /// Billing events.
    Billing,
    /// Picking floor events.
    Picking,
    /// Put-wall events.
    Walling,
    /// Warehouse execution events.
    Wes,
    /// Outbound shipping events.
    Shipping,
}

impl EventDomain {
    /// Reverse-DNS category segment used in the wire `type` attribute.
    pub fn category(&self) -> &'static str {
        match self {
            EventDomain::Orders => "orders",
            EventDomain::Waves => "waves",
            EventDomain::Inventory => "inventory",
            EventDomain::Billing => "billing",
            EventDomain::Picking => "picking",
            EventDomain::Walling => "walling",
            EventDomain::Wes => "wes",
            EventDomain::Shipping => "shipping",
        }
    }

    /// Bus topic this domain publishes to.
    pub fn topic(&self) -> Topic {
        match self {
            EventDomain::Orders => Topic::Orders,
            EventDomain::Waves => Topic::Waves,
            EventDomain::Inventory => Topic::Inventory,
            EventDomain::Billing => Topic::Billing,
            EventDomain::Picking => Topic::Picking,
            EventDomain::Walling => Topic::Walling,
            EventDomain::Wes => Topic::Wes,
            EventDomain::Shipping => Topic::Shipping,
        }
    }
}

//─────────────────────────────
//  Shared payload records
//─────────────────────────────

/// One line of an order: what to pick and how much.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    /// SKU to pick.
    pub sku: SkuId,
    /// Quantity ordered.
    pub quantity: u32,
    /// Warehouse zone the SKU is slotted in, when known at creation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub zone: Option<String>,
}

/// An item confirmed picked by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickedItem {
    /// SKU picked.
    pub sku: SkuId,
    /// Location it was taken from.
    pub location_id: LocationId,
    /// Quantity picked.
    pub quantity: u32,
    /// Tote it was placed in.
    pub tote_id: String,
}

/// An item placed into a put-wall slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortedItem {
    /// SKU sorted.
    pub sku: SkuId,
    /// Wall slot it landed in.
    pub slot: String,
}

//─────────────────────────────
//  Per-domain event enumerations
//─────────────────────────────

/// Order lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    /// Order accepted into the system.
    Received {
        /// Owning customer.
        customer_id: CustomerId,
        /// Service tier.
        priority: Priority,
        /// Ordered lines.
        lines: Vec<OrderLine>,
        /// Whether lines span multiple zones.
        multi_zone: bool,
    },
    /// Order passed validation.
    Validated,
    /// Order planned into a wave.
    AssignedToWave {
        /// Wave it joined.
        wave_id: WaveId,
        /// When the wave is scheduled to start.
        scheduled_start: DateTime<Utc>,
    },
    /// Picking started on the warehouse floor.
    PickingStarted,
    /// Multi-zone totes are being consolidated.
    ConsolidationStarted,
    /// Packing station took the order.
    PackingStarted,
    /// Package handed to the carrier.
    Shipped {
        /// Carrier tracking number.
        tracking_number: String,
        /// Carrier code.
        carrier: String,
    },
    /// Terminal happy-path state.
    Completed,
    /// Terminal cancelled state.
    Cancelled {
        /// Why the order was cancelled.
        reason: String,
    },
}

impl OrderEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Received { .. } => "order.received",
            OrderEvent::Validated => "order.validated",
            OrderEvent::AssignedToWave { .. } => "order.assigned_to_wave",
            OrderEvent::PickingStarted => "order.picking_started",
            OrderEvent::ConsolidationStarted => "order.consolidation_started",
            OrderEvent::PackingStarted => "order.packing_started",
            OrderEvent::Shipped { .. } => "order.shipped",
            OrderEvent::Completed => "order.completed",
            OrderEvent::Cancelled { .. } => "order.cancelled",
        }
    }
}

/// Wave planning events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WaveEvent {
    /// Wave opened for planning.
    Planned {
        /// Maximum orders the wave accepts.
        max_orders: u32,
        /// Maximum items the wave accepts.
        max_items: u32,
    },
    /// Order added to the wave during planning.
    OrderAdded {
        /// Joining order.
        order_id: OrderId,
        /// Items the order contributes.
        item_count: u32,
    },
    /// Order removed before release.
    OrderRemoved {
        /// Removed order.
        order_id: OrderId,
    },
    /// Wave scheduled for a start time.
    Scheduled {
        /// Planned start.
        scheduled_start: DateTime<Utc>,
    },
    /// Wave released to the floor.
    Released,
    /// Work started.
    InProgress,
    /// All orders in the wave finished.
    Completed,
    /// Wave abandoned.
    Cancelled {
        /// Why the wave was cancelled.
        reason: String,
    },
}

impl WaveEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            WaveEvent::Planned { .. } => "wave.planned",
            WaveEvent::OrderAdded { .. } => "wave.order_added",
            WaveEvent::OrderRemoved { .. } => "wave.order_removed",
            WaveEvent::Scheduled { .. } => "wave.scheduled",
            WaveEvent::Released => "wave.released",
            WaveEvent::InProgress => "wave.in_progress",
            WaveEvent::Completed => "wave.completed",
            WaveEvent::Cancelled { .. } => "wave.cancelled",
        }
    }
}

/// Inventory ledger events, one aggregate per SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InventoryEvent {
    /// Stock received into a location.
    Received {
        /// Receiving location.
        location_id: LocationId,
        /// Units received.
        quantity: u32,
    },
    /// Units reserved for an order.
    Reserved {
        /// Reserving order.
        order_id: OrderId,
        /// Location reserved against.
        location_id: LocationId,
        /// Units reserved.
        quantity: u32,
    },
    /// A reservation released back to available stock.
    Released {
        /// Order whose reservation was released.
        order_id: OrderId,
        /// Units released.
        quantity: u32,
    },
    /// A reservation consumed at ship time.
    Committed {
        /// Order whose reservation was consumed.
        order_id: OrderId,
        /// Units removed from stock.
        quantity: u32,
    },
    /// Manual or cycle-count adjustment.
    Adjusted {
        /// Adjusted location.
        location_id: LocationId,
        /// Signed unit delta.
        delta: i64,
        /// Operator-supplied reason.
        reason: String,
    },
}

impl InventoryEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::Received { .. } => "inventory.received",
            InventoryEvent::Reserved { .. } => "inventory.reserved",
            InventoryEvent::Released { .. } => "inventory.released",
            InventoryEvent::Committed { .. } => "inventory.committed",
            InventoryEvent::Adjusted { .. } => "inventory.adjusted",
        }
    }
}

/// Billing invoice events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InvoiceEvent {
    /// Invoice opened in draft.
    Drafted {
        /// Billed customer.
        customer_id: CustomerId,
    },
    /// Line item appended to a draft.
    LineAdded {
        /// Line description.
        description: String,
        /// Line amount in minor currency units.
        amount_cents: i64,
    },
    /// Draft frozen; line items immutable from here on.
    Finalized {
        /// Invoice total in minor currency units.
        total_cents: i64,
    },
    /// Payment received in full.
    Paid,
    /// Payment window elapsed without settlement.
    Overdue,
    /// Invoice voided.
    Voided {
        /// Why the invoice was voided.
        reason: String,
    },
}

impl InvoiceEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::Drafted { .. } => "invoice.drafted",
            InvoiceEvent::LineAdded { .. } => "invoice.line_added",
            InvoiceEvent::Finalized { .. } => "invoice.finalized",
            InvoiceEvent::Paid => "invoice.paid",
            InvoiceEvent::Overdue => "invoice.overdue",
            InvoiceEvent::Voided { .. } => "invoice.voided",
        }
    }
}

/// Picking floor events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PickingEvent {
    /// Pick task created for a route.
    TaskCreated {
        /// Order being picked.
        order_id: OrderId,
        /// Route the task belongs to.
        route_id: String,
        /// Lines to pick.
        lines: Vec<OrderLine>,
    },
    /// Operator claimed the task.
    WorkerAssigned {
        /// Operator id.
        worker_id: String,
        /// Tote issued to the operator.
        tote_id: String,
    },
    /// One item picked.
    ItemPicked {
        /// The picked item.
        item: PickedItem,
    },
    /// Operator raised an exception on a SKU.
    ExceptionRaised {
        /// Problem SKU.
        sku: SkuId,
        /// Operator-reported reason.
        reason: String,
    },
    /// Exception resolved from an alternate location.
    ExceptionResolved {
        /// Recovered SKU.
        sku: SkuId,
        /// Location the pick was redirected to.
        alternate_location: LocationId,
    },
    /// Task finished.
    Completed {
        /// Whether every line was picked.
        success: bool,
        /// Items picked.
        picked: Vec<PickedItem>,
    },
    /// Task cancelled during saga compensation.
    TaskCancelled,
}

impl PickingEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            PickingEvent::TaskCreated { .. } => "picking.task_created",
            PickingEvent::WorkerAssigned { .. } => "picking.worker_assigned",
            PickingEvent::ItemPicked { .. } => "picking.item_picked",
            PickingEvent::ExceptionRaised { .. } => "picking.exception_raised",
            PickingEvent::ExceptionResolved { .. } => "picking.exception_resolved",
            PickingEvent::Completed { .. } => "picking.completed",
            PickingEvent::TaskCancelled => "picking.task_cancelled",
        }
    }
}

/// Put-wall events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WallingEvent {
    /// Wall task created for a route.
    TaskCreated {
        /// Route feeding the wall.
        route_id: String,
    },
    /// Wall task finished.
    Completed {
        /// Task id.
        task_id: String,
        /// Route the task served.
        route_id: String,
        /// Items sorted into slots.
        sorted_items: Vec<SortedItem>,
        /// Whether the sort succeeded.
        success: bool,
    },
}

impl WallingEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            WallingEvent::TaskCreated { .. } => "walling.task_created",
            WallingEvent::Completed { .. } => "walling.completed",
        }
    }
}

/// Warehouse execution events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WesEvent {
    /// Route started with a selected template.
    RouteStarted {
        /// Route id.
        route_id: String,
        /// Template name (`pick_pack`, `pick_wall_pack`, `pick_consolidate_pack`).
        template: String,
    },
    /// Totes consolidated at a station.
    ConsolidationCompleted {
        /// Whether consolidation succeeded.
        success: bool,
    },
    /// Route finished all stages.
    RouteCompleted {
        /// Route id.
        route_id: String,
    },
}

impl WesEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            WesEvent::RouteStarted { .. } => "wes.route_started",
            WesEvent::ConsolidationCompleted { .. } => "wes.consolidation_completed",
            WesEvent::RouteCompleted { .. } => "wes.route_completed",
        }
    }
}

/// Outbound shipping events, including the SLAM steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShippingEvent {
    /// Outbound shipment opened for an order.
    ShipmentCreated {
        /// Order being shipped.
        order_id: OrderId,
    },
    /// Sortation batch created.
    BatchCreated {
        /// Batch id.
        batch_id: String,
    },
    /// Sortation lane assigned.
    LaneAssigned {
        /// Lane code.
        lane: String,
    },
    /// Sortation confirmed complete.
    SortationConfirmed,
    /// Package scanned at the SLAM line.
    Scanned {
        /// Package id.
        package_id: String,
    },
    /// Shipping label generated.
    Labeled {
        /// Carrier tracking number.
        tracking_number: String,
        /// Carrier code.
        carrier: String,
    },
    /// Label applied to the package.
    LabelApplied,
    /// Package added to the carrier manifest.
    Manifested {
        /// Manifest id.
        manifest_id: String,
    },
    /// Shipment confirmed, by signal or auto-confirmation.
    Confirmed {
        /// Hand-off instant.
        shipped_at: DateTime<Utc>,
        /// Carrier delivery estimate.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        estimated_delivery: Option<DateTime<Utc>>,
    },
}

impl ShippingEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        match self {
            ShippingEvent::ShipmentCreated { .. } => "shipping.shipment_created",
            ShippingEvent::BatchCreated { .. } => "shipping.batch_created",
            ShippingEvent::LaneAssigned { .. } => "shipping.lane_assigned",
            ShippingEvent::SortationConfirmed => "shipping.sortation_confirmed",
            ShippingEvent::Scanned { .. } => "shipping.scanned",
            ShippingEvent::Labeled { .. } => "shipping.labeled",
            ShippingEvent::LabelApplied => "shipping.label_applied",
            ShippingEvent::Manifested { .. } => "shipping.manifested",
            ShippingEvent::Confirmed { .. } => "shipping.confirmed",
        }
    }
}

//─────────────────────────────
//  The unified payload union
//─────────────────────────────

/// Every event payload Wharf can emit, tagged by domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum DomainEventPayload {
    /// Order lifecycle.
    Order(OrderEvent),
    /// Wave planning.
    Wave(WaveEvent),
    /// Inventory ledger.
    Inventory(InventoryEvent),
    /// Billing.
    Invoice(InvoiceEvent),
    /// Picking floor.
    Picking(PickingEvent),
    /// Put-wall.
    Walling(WallingEvent),
    /// Warehouse execution.
    Wes(WesEvent),
    /// Outbound shipping.
    Shipping(ShippingEvent),
}

impl DomainEventPayload {
    /// Dotted event type string (`order.received`, `wave.released`, …).
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEventPayload::Order(e) => e.event_type(),
            DomainEventPayload::Wave(e) => e.event_type(),
            DomainEventPayload::Inventory(e) => e.event_type(),
            DomainEventPayload::Invoice(e) => e.event_type(),
            DomainEventPayload::Picking(e) => e.event_type(),
            DomainEventPayload::Walling(e) => e.event_type(),
            DomainEventPayload::Wes(e) => e.event_type(),
            DomainEventPayload::Shipping(e) => e.event_type(),
        }
    }

    /// Domain the payload belongs to.
    pub fn domain(&self) -> EventDomain {
        match self {
            DomainEventPayload::Order(_) => EventDomain::Orders,
            DomainEventPayload::Wave(_) => EventDomain::Waves,
            DomainEventPayload::Inventory(_) => EventDomain::Inventory,
            DomainEventPayload::Invoice(_) => EventDomain::Billing,
            DomainEventPayload::Picking(_) => EventDomain::Picking,
            DomainEventPayload::Walling(_) => EventDomain::Walling,
            DomainEventPayload::Wes(_) => EventDomain::Wes,
            DomainEventPayload::Shipping(_) => EventDomain::Shipping,
        }
    }
}

//─────────────────────────────
//  Domain event record
//─────────────────────────────

/// An immutable fact recorded by an aggregate command.
///
/// Events are buffered inside the aggregate until the writing transaction
/// commits; ordering is preserved per aggregate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Kind of aggregate.
    pub aggregate_type: AggregateType,
    /// When the command appended the event.
    pub occurred_at: DateTime<Utc>,
    /// Typed payload.
    pub payload: DomainEventPayload,
}

impl DomainEvent {
    /// Dotted event type string.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Topic the event publishes to.
    pub fn topic(&self) -> Topic {
        self.payload.domain().topic()
    }
}
