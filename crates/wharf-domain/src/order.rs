//! Customer order aggregate.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use wharf_events::{
    AggregateType, DomainEvent, DomainEventPayload, OrderEvent, OrderLine,
};
use wharf_types::{Clock, CustomerId, OrderId, Priority, WaveId, WmsError};

use crate::Aggregate;

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, not yet validated.
    Received,
    /// Validation passed.
    Validated,
    /// Planned into a wave.
    WaveAssigned,
    /// Picking in progress.
    Picking,
    /// Multi-zone totes being consolidated.
    Consolidating,
    /// At a packing station.
    Packing,
    /// Handed to the carrier.
    Shipped,
    /// Terminal happy path.
    Completed,
    /// Terminal cancelled.
    Cancelled,
}

impl OrderStatus {
    /// Whether the order can still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Shipped | OrderStatus::Completed | OrderStatus::Cancelled
        )
    }

    /// Whether this is a sink state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

/// A customer order moving through fulfillment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer_id: CustomerId,
    priority: Priority,
    lines: Vec<OrderLine>,
    multi_zone: bool,
    status: OrderStatus,
    wave_id: Option<WaveId>,
    tracking_number: Option<String>,
    carrier: Option<String>,
    cancel_reason: Option<String>,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl Order {
    /// Accept a new order. Validates that it has at least one line and that
    /// every line has a positive quantity.
    pub fn create(
        id: OrderId,
        customer_id: CustomerId,
        priority: Priority,
        lines: Vec<OrderLine>,
        clock: &dyn Clock,
    ) -> Result<Self, WmsError> {
        if lines.is_empty() {
            return Err(WmsError::validation("order must have at least one line"));
        }
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(WmsError::validation(format!(
                "line for sku {} has zero quantity",
                line.sku
            )));
        }

        let zones: BTreeSet<&str> = lines
            .iter()
            .filter_map(|l| l.zone.as_deref())
            .collect();
        let multi_zone = zones.len() > 1;

        let mut order = Self {
            id,
            customer_id: customer_id.clone(),
            priority,
            lines: lines.clone(),
            multi_zone,
            status: OrderStatus::Received,
            wave_id: None,
            tracking_number: None,
            carrier: None,
            cancel_reason: None,
            version: 0,
            pending: Vec::new(),
        };
        order.record(
            OrderEvent::Received {
                customer_id,
                priority,
                lines,
                multi_zone,
            },
            clock,
        );
        Ok(order)
    }

    /// Mark the order validated. Re-validating an already validated order is
    /// a no-op so activity retries stay idempotent.
    pub fn validate(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Received => {
                self.status = OrderStatus::Validated;
                self.record(OrderEvent::Validated, clock);
                Ok(())
            }
            OrderStatus::Validated => Ok(()),
            _ => Err(self.transition_conflict("validate")),
        }
    }

    /// Plan the order into a wave.
    pub fn assign_to_wave(
        &mut self,
        wave_id: WaveId,
        scheduled_start: chrono::DateTime<chrono::Utc>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Validated => {
                self.status = OrderStatus::WaveAssigned;
                self.wave_id = Some(wave_id.clone());
                self.record(
                    OrderEvent::AssignedToWave {
                        wave_id,
                        scheduled_start,
                    },
                    clock,
                );
                Ok(())
            }
            OrderStatus::WaveAssigned if self.wave_id.as_ref() == Some(&wave_id) => Ok(()),
            OrderStatus::WaveAssigned => Err(WmsError::conflict(format!(
                "order {} already assigned to wave {}",
                self.id,
                self.wave_id.as_ref().map(|w| w.as_str()).unwrap_or("?")
            ))),
            _ => Err(self.transition_conflict("assign_to_wave")),
        }
    }

    /// Picking started on the floor.
    pub fn start_picking(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::WaveAssigned => {
                self.status = OrderStatus::Picking;
                self.record(OrderEvent::PickingStarted, clock);
                Ok(())
            }
            OrderStatus::Picking => Ok(()),
            _ => Err(self.transition_conflict("start_picking")),
        }
    }

    /// Multi-zone totes are being consolidated. Only valid for multi-zone
    /// orders.
    pub fn start_consolidation(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        if !self.multi_zone {
            return Err(WmsError::validation(format!(
                "order {} is single-zone and does not consolidate",
                self.id
            )));
        }
        match self.status {
            OrderStatus::Picking => {
                self.status = OrderStatus::Consolidating;
                self.record(OrderEvent::ConsolidationStarted, clock);
                Ok(())
            }
            OrderStatus::Consolidating => Ok(()),
            _ => Err(self.transition_conflict("start_consolidation")),
        }
    }

    /// Packing station took the order.
    pub fn start_packing(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Picking | OrderStatus::Consolidating => {
                self.status = OrderStatus::Packing;
                self.record(OrderEvent::PackingStarted, clock);
                Ok(())
            }
            OrderStatus::Packing => Ok(()),
            _ => Err(self.transition_conflict("start_packing")),
        }
    }

    /// Package handed to the carrier.
    pub fn mark_shipped(
        &mut self,
        tracking_number: String,
        carrier: String,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Packing => {
                self.status = OrderStatus::Shipped;
                self.tracking_number = Some(tracking_number.clone());
                self.carrier = Some(carrier.clone());
                self.record(
                    OrderEvent::Shipped {
                        tracking_number,
                        carrier,
                    },
                    clock,
                );
                Ok(())
            }
            OrderStatus::Shipped => Ok(()),
            _ => Err(self.transition_conflict("mark_shipped")),
        }
    }

    /// Close out the order after shipment confirmation.
    pub fn complete(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Shipped => {
                self.status = OrderStatus::Completed;
                self.record(OrderEvent::Completed, clock);
                Ok(())
            }
            OrderStatus::Completed => Ok(()),
            _ => Err(self.transition_conflict("complete")),
        }
    }

    /// Cancel the order. Allowed from any pre-shipped state; cancelling an
    /// already cancelled order is a no-op.
    pub fn cancel(&mut self, reason: impl Into<String>, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            OrderStatus::Cancelled => Ok(()),
            s if s.is_cancellable() => {
                let reason = reason.into();
                self.status = OrderStatus::Cancelled;
                self.cancel_reason = Some(reason.clone());
                self.record(OrderEvent::Cancelled { reason }, clock);
                Ok(())
            }
            _ => Err(WmsError::conflict(format!(
                "order {} already shipped; cannot cancel",
                self.id
            ))),
        }
    }

    /// Current status.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Order id.
    pub fn id(&self) -> &OrderId {
        &self.id
    }

    /// Owning customer.
    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    /// Service tier.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Ordered lines.
    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    /// Total item count across lines.
    pub fn item_count(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Whether lines span multiple zones.
    pub fn is_multi_zone(&self) -> bool {
        self.multi_zone
    }

    /// Wave the order was planned into, once assigned.
    pub fn wave_id(&self) -> Option<&WaveId> {
        self.wave_id.as_ref()
    }

    /// Cancellation reason, when cancelled.
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    fn record(&mut self, event: OrderEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.id.0.clone(),
            aggregate_type: AggregateType::Order,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Order(event),
        });
    }

    fn transition_conflict(&self, command: &str) -> WmsError {
        WmsError::conflict(format!(
            "order {} cannot {command} in state {:?}",
            self.id, self.status
        ))
    }
}

impl Aggregate for Order {
    fn aggregate_type() -> AggregateType {
        AggregateType::Order
    }

    fn aggregate_id(&self) -> String {
        self.id.0.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn pending_events(&self) -> &[DomainEvent] {
        &self.pending
    }

    fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_types::SystemClock;

    fn lines(zoned: bool) -> Vec<OrderLine> {
        vec![
            OrderLine {
                sku: "SKU-A".into(),
                quantity: 1,
                zone: zoned.then(|| "A".to_owned()),
            },
            OrderLine {
                sku: "SKU-B".into(),
                quantity: 2,
                zone: zoned.then(|| "B".to_owned()),
            },
        ]
    }

    fn received_order() -> Order {
        Order::create(
            OrderId::from("ORD-1"),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            lines(false),
            &SystemClock,
        )
        .unwrap()
    }

    #[test]
    fn create_emits_received_and_detects_zones() {
        let clock = SystemClock;
        let order = Order::create(
            OrderId::from("ORD-1"),
            CustomerId::from("CUST-1"),
            Priority::SameDay,
            lines(true),
            &clock,
        )
        .unwrap();

        assert!(order.is_multi_zone());
        assert_eq!(order.status(), OrderStatus::Received);
        assert_eq!(order.pending_events().len(), 1);
        assert_eq!(order.pending_events()[0].event_type(), "order.received");
        assert_eq!(order.item_count(), 3);
    }

    #[test]
    fn create_rejects_empty_and_zero_quantity() {
        let clock = SystemClock;
        let err = Order::create(
            OrderId::from("ORD-1"),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            vec![],
            &clock,
        )
        .unwrap_err();
        assert!(err.is_command_failure());

        let err = Order::create(
            OrderId::from("ORD-1"),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            vec![OrderLine {
                sku: "SKU-A".into(),
                quantity: 0,
                zone: None,
            }],
            &clock,
        )
        .unwrap_err();
        assert!(err.message.contains("zero quantity"));
    }

    #[test]
    fn happy_path_walks_every_state() {
        let clock = SystemClock;
        let mut order = received_order();
        order.validate(&clock).unwrap();
        order
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        order.start_picking(&clock).unwrap();
        order.start_packing(&clock).unwrap();
        order
            .mark_shipped("TRK-1".into(), "UPX".into(), &clock)
            .unwrap();
        order.complete(&clock).unwrap();

        assert_eq!(order.status(), OrderStatus::Completed);
        let types: Vec<&str> = order.pending_events().iter().map(|e| e.event_type()).collect();
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
    }

    #[test]
    fn failed_command_appends_nothing() {
        let clock = SystemClock;
        let mut order = received_order();
        let before = order.pending_events().len();
        assert!(order.start_packing(&clock).is_err());
        assert_eq!(order.pending_events().len(), before);
        assert_eq!(order.status(), OrderStatus::Received);
    }

    #[test]
    fn repeated_commands_are_noops() {
        let clock = SystemClock;
        let mut order = received_order();
        order.validate(&clock).unwrap();
        order.validate(&clock).unwrap();
        let validated_events = order
            .pending_events()
            .iter()
            .filter(|e| e.event_type() == "order.validated")
            .count();
        assert_eq!(validated_events, 1);

        order
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        // Same wave again: fine. Different wave: conflict.
        order
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        assert!(order
            .assign_to_wave(WaveId::from("WV-2"), chrono::Utc::now(), &clock)
            .is_err());
    }

    #[test]
    fn cancel_allowed_until_shipped() {
        let clock = SystemClock;
        let mut order = received_order();
        order.validate(&clock).unwrap();
        order.cancel("wave_timeout", &clock).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.cancel_reason(), Some("wave_timeout"));

        let mut shipped = received_order();
        shipped.validate(&clock).unwrap();
        shipped
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        shipped.start_picking(&clock).unwrap();
        shipped.start_packing(&clock).unwrap();
        shipped
            .mark_shipped("TRK-1".into(), "UPX".into(), &clock)
            .unwrap();
        assert!(shipped.cancel("too late", &clock).is_err());
    }

    #[test]
    fn consolidation_requires_multi_zone() {
        let clock = SystemClock;
        let mut single = received_order();
        single.validate(&clock).unwrap();
        single
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        single.start_picking(&clock).unwrap();
        assert!(single.start_consolidation(&clock).is_err());

        let mut multi = Order::create(
            OrderId::from("ORD-2"),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            lines(true),
            &clock,
        )
        .unwrap();
        multi.validate(&clock).unwrap();
        multi
            .assign_to_wave(WaveId::from("WV-1"), chrono::Utc::now(), &clock)
            .unwrap();
        multi.start_picking(&clock).unwrap();
        multi.start_consolidation(&clock).unwrap();
        multi.start_packing(&clock).unwrap();
        assert_eq!(multi.status(), OrderStatus::Packing);
    }

    #[test]
    fn buffer_survives_serde_as_empty() {
        let clock = SystemClock;
        let order = received_order();
        assert_eq!(order.pending_events().len(), 1);
        let json = serde_json::to_string(&order).unwrap();
        let loaded: Order = serde_json::from_str(&json).unwrap();
        // The buffer is never persisted; a loaded aggregate starts clean.
        assert!(loaded.pending_events().is_empty());
        assert_eq!(loaded.status(), OrderStatus::Received);
        let _ = clock;
    }
}
