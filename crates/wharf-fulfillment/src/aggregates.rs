//! Execution-domain write models owned by the fulfillment service: the pick
//! task and the outbound shipment. Same aggregate contract as the core
//! domain aggregates, different bounded context.

use serde::{Deserialize, Serialize};

use wharf_domain::Aggregate;
use wharf_events::{
    AggregateType, DomainEvent, DomainEventPayload, OrderLine, PickedItem, PickingEvent,
    ShippingEvent,
};
use wharf_types::{Clock, LocationId, OrderId, SkuId, WmsError};

//─────────────────────────────
//  Pick task
//─────────────────────────────

/// Pick task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickTaskStatus {
    /// Created, waiting for an operator.
    Created,
    /// Operator claimed it.
    Assigned,
    /// Items being picked.
    InProgress,
    /// Finished.
    Completed,
    /// Cancelled during compensation.
    Cancelled,
}

impl PickTaskStatus {
    /// Whether this is a sink state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PickTaskStatus::Completed | PickTaskStatus::Cancelled)
    }
}

/// One picking assignment for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickTask {
    id: String,
    order_id: OrderId,
    route_id: String,
    lines: Vec<OrderLine>,
    status: PickTaskStatus,
    worker_id: Option<String>,
    tote_id: Option<String>,
    picked: Vec<PickedItem>,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl PickTask {
    /// Create a task for a route.
    pub fn create(
        id: impl Into<String>,
        order_id: OrderId,
        route_id: impl Into<String>,
        lines: Vec<OrderLine>,
        clock: &dyn Clock,
    ) -> Result<Self, WmsError> {
        if lines.is_empty() {
            return Err(WmsError::validation("pick task needs at least one line"));
        }
        let route_id = route_id.into();
        let mut task = Self {
            id: id.into(),
            order_id: order_id.clone(),
            route_id: route_id.clone(),
            lines: lines.clone(),
            status: PickTaskStatus::Created,
            worker_id: None,
            tote_id: None,
            picked: Vec::new(),
            version: 0,
            pending: Vec::new(),
        };
        task.record(
            PickingEvent::TaskCreated {
                order_id,
                route_id,
                lines,
            },
            clock,
        );
        Ok(task)
    }

    /// Operator claimed the task. Re-claiming by the same operator is a
    /// no-op.
    pub fn assign_worker(
        &mut self,
        worker_id: impl Into<String>,
        tote_id: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        let worker_id = worker_id.into();
        match self.status {
            PickTaskStatus::Created => {
                let tote_id = tote_id.into();
                self.status = PickTaskStatus::Assigned;
                self.worker_id = Some(worker_id.clone());
                self.tote_id = Some(tote_id.clone());
                self.record(PickingEvent::WorkerAssigned { worker_id, tote_id }, clock);
                Ok(())
            }
            PickTaskStatus::Assigned if self.worker_id.as_deref() == Some(&worker_id) => Ok(()),
            _ => Err(self.transition_conflict("assign_worker")),
        }
    }

    /// One item picked.
    pub fn record_pick(&mut self, item: PickedItem, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            PickTaskStatus::Assigned | PickTaskStatus::InProgress => {
                self.status = PickTaskStatus::InProgress;
                self.picked.push(item.clone());
                self.record(PickingEvent::ItemPicked { item }, clock);
                Ok(())
            }
            _ => Err(self.transition_conflict("record_pick")),
        }
    }

    /// Operator raised an exception on a SKU.
    pub fn raise_exception(
        &mut self,
        sku: SkuId,
        reason: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if self.status.is_terminal() {
            return Err(self.transition_conflict("raise_exception"));
        }
        self.record(
            PickingEvent::ExceptionRaised {
                sku,
                reason: reason.into(),
            },
            clock,
        );
        Ok(())
    }

    /// Exception resolved from an alternate location.
    pub fn resolve_exception(
        &mut self,
        sku: SkuId,
        alternate_location: LocationId,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if self.status.is_terminal() {
            return Err(self.transition_conflict("resolve_exception"));
        }
        self.record(
            PickingEvent::ExceptionResolved {
                sku,
                alternate_location,
            },
            clock,
        );
        Ok(())
    }

    /// Close the task.
    pub fn complete(&mut self, success: bool, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            PickTaskStatus::Assigned | PickTaskStatus::InProgress => {
                self.status = PickTaskStatus::Completed;
                self.record(
                    PickingEvent::Completed {
                        success,
                        picked: self.picked.clone(),
                    },
                    clock,
                );
                Ok(())
            }
            PickTaskStatus::Completed => Ok(()),
            _ => Err(self.transition_conflict("complete")),
        }
    }

    /// Cancel during compensation. A no-op on already-terminal tasks so the
    /// compensation activity stays idempotent.
    pub fn cancel(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        if self.status.is_terminal() {
            return Ok(());
        }
        self.status = PickTaskStatus::Cancelled;
        self.record(PickingEvent::TaskCancelled, clock);
        Ok(())
    }

    /// Task id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status.
    pub fn status(&self) -> PickTaskStatus {
        self.status
    }

    /// Items picked so far.
    pub fn picked(&self) -> &[PickedItem] {
        &self.picked
    }

    fn record(&mut self, event: PickingEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.id.clone(),
            aggregate_type: AggregateType::PickTask,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Picking(event),
        });
    }

    fn transition_conflict(&self, command: &str) -> WmsError {
        WmsError::conflict(format!(
            "pick task {} cannot {command} in state {:?}",
            self.id, self.status
        ))
    }
}

impl Aggregate for PickTask {
    fn aggregate_type() -> AggregateType {
        AggregateType::PickTask
    }

    fn aggregate_id(&self) -> String {
        self.id.clone()
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

//─────────────────────────────
//  Shipment
//─────────────────────────────

/// Linear SLAM progression of an outbound shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStage {
    /// Opened for an order.
    Created,
    /// Sortation batch created.
    Batched,
    /// Sortation lane assigned.
    LaneAssigned,
    /// Sortation confirmed.
    Sorted,
    /// Scanned at the SLAM line.
    Scanned,
    /// Label generated.
    Labeled,
    /// Label applied.
    Applied,
    /// On the carrier manifest.
    Manifested,
    /// Hand-off confirmed.
    Confirmed,
}

/// One package moving through sortation and SLAM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    id: String,
    order_id: OrderId,
    stage: ShipmentStage,
    batch_id: Option<String>,
    lane: Option<String>,
    package_id: Option<String>,
    tracking_number: Option<String>,
    carrier: Option<String>,
    manifest_id: Option<String>,
    shipped_at: Option<chrono::DateTime<chrono::Utc>>,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl Shipment {
    /// Open a shipment for an order.
    pub fn create(id: impl Into<String>, order_id: OrderId, clock: &dyn Clock) -> Self {
        let mut shipment = Self {
            id: id.into(),
            order_id: order_id.clone(),
            stage: ShipmentStage::Created,
            batch_id: None,
            lane: None,
            package_id: None,
            tracking_number: None,
            carrier: None,
            manifest_id: None,
            shipped_at: None,
            version: 0,
            pending: Vec::new(),
        };
        shipment.record(ShippingEvent::ShipmentCreated { order_id }, clock);
        shipment
    }

    /// Sortation: create the batch.
    pub fn create_batch(
        &mut self,
        batch_id: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Created, ShipmentStage::Batched, clock, |s| {
            let batch_id = batch_id.into();
            s.batch_id = Some(batch_id.clone());
            ShippingEvent::BatchCreated { batch_id }
        })
    }

    /// Sortation: assign the lane.
    pub fn assign_lane(
        &mut self,
        lane: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Batched, ShipmentStage::LaneAssigned, clock, |s| {
            let lane = lane.into();
            s.lane = Some(lane.clone());
            ShippingEvent::LaneAssigned { lane }
        })
    }

    /// Sortation: confirm.
    pub fn confirm_sortation(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        self.advance(ShipmentStage::LaneAssigned, ShipmentStage::Sorted, clock, |_| {
            ShippingEvent::SortationConfirmed
        })
    }

    /// SLAM: scan.
    pub fn scan(
        &mut self,
        package_id: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Sorted, ShipmentStage::Scanned, clock, |s| {
            let package_id = package_id.into();
            s.package_id = Some(package_id.clone());
            ShippingEvent::Scanned { package_id }
        })
    }

    /// SLAM: generate the label.
    pub fn label(
        &mut self,
        tracking_number: impl Into<String>,
        carrier: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Scanned, ShipmentStage::Labeled, clock, |s| {
            let tracking_number = tracking_number.into();
            let carrier = carrier.into();
            s.tracking_number = Some(tracking_number.clone());
            s.carrier = Some(carrier.clone());
            ShippingEvent::Labeled {
                tracking_number,
                carrier,
            }
        })
    }

    /// SLAM: apply the label.
    pub fn apply_label(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Labeled, ShipmentStage::Applied, clock, |_| {
            ShippingEvent::LabelApplied
        })
    }

    /// SLAM: add to the carrier manifest.
    pub fn manifest(
        &mut self,
        manifest_id: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Applied, ShipmentStage::Manifested, clock, |s| {
            let manifest_id = manifest_id.into();
            s.manifest_id = Some(manifest_id.clone());
            ShippingEvent::Manifested { manifest_id }
        })
    }

    /// Confirm hand-off, by carrier signal or auto-confirmation.
    pub fn confirm(
        &mut self,
        shipped_at: chrono::DateTime<chrono::Utc>,
        estimated_delivery: Option<chrono::DateTime<chrono::Utc>>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        self.advance(ShipmentStage::Manifested, ShipmentStage::Confirmed, clock, |s| {
            s.shipped_at = Some(shipped_at);
            ShippingEvent::Confirmed {
                shipped_at,
                estimated_delivery,
            }
        })
    }

    /// Shipment id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current stage.
    pub fn stage(&self) -> ShipmentStage {
        self.stage
    }

    /// Tracking number, once labeled.
    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    /// Carrier, once labeled.
    pub fn carrier(&self) -> Option<&str> {
        self.carrier.as_deref()
    }

    // Linear stage guard: `from -> to` applies the mutation and records the
    // event; re-running a command at `to` is a no-op; anything else is a
    // conflict.
    fn advance<F>(
        &mut self,
        from: ShipmentStage,
        to: ShipmentStage,
        clock: &dyn Clock,
        build: F,
    ) -> Result<(), WmsError>
    where
        F: FnOnce(&mut Self) -> ShippingEvent,
    {
        if self.stage == to {
            return Ok(());
        }
        if self.stage != from {
            return Err(WmsError::conflict(format!(
                "shipment {} is {:?}; expected {from:?}",
                self.id, self.stage
            )));
        }
        self.stage = to;
        let event = build(self);
        self.record(event, clock);
        Ok(())
    }

    fn record(&mut self, event: ShippingEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.id.clone(),
            aggregate_type: AggregateType::Shipment,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Shipping(event),
        });
    }
}

impl Aggregate for Shipment {
    fn aggregate_type() -> AggregateType {
        AggregateType::Shipment
    }

    fn aggregate_id(&self) -> String {
        self.id.clone()
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

    fn lines() -> Vec<OrderLine> {
        vec![OrderLine {
            sku: SkuId::from("SKU-A"),
            quantity: 2,
            zone: None,
        }]
    }

    #[test]
    fn pick_task_lifecycle() {
        let clock = SystemClock;
        let mut task = PickTask::create(
            "pick-route-1",
            OrderId::from("ORD-1"),
            "route-1",
            lines(),
            &clock,
        )
        .unwrap();
        task.assign_worker("W-1", "TOTE-1", &clock).unwrap();
        task.record_pick(
            PickedItem {
                sku: SkuId::from("SKU-A"),
                location_id: LocationId::from("A-01"),
                quantity: 2,
                tote_id: "TOTE-1".to_owned(),
            },
            &clock,
        )
        .unwrap();
        task.complete(true, &clock).unwrap();

        assert_eq!(task.status(), PickTaskStatus::Completed);
        let types: Vec<&str> = task.pending_events().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "picking.task_created",
                "picking.worker_assigned",
                "picking.item_picked",
                "picking.completed",
            ]
        );
    }

    #[test]
    fn cancelling_a_completed_task_is_a_noop() {
        let clock = SystemClock;
        let mut task = PickTask::create(
            "pick-1",
            OrderId::from("ORD-1"),
            "route-1",
            lines(),
            &clock,
        )
        .unwrap();
        task.assign_worker("W-1", "TOTE-1", &clock).unwrap();
        task.complete(true, &clock).unwrap();
        let before = task.pending_events().len();
        task.cancel(&clock).unwrap();
        assert_eq!(task.status(), PickTaskStatus::Completed);
        assert_eq!(task.pending_events().len(), before);
    }

    #[test]
    fn exception_events_are_recorded_in_flight() {
        let clock = SystemClock;
        let mut task = PickTask::create(
            "pick-1",
            OrderId::from("ORD-1"),
            "route-1",
            lines(),
            &clock,
        )
        .unwrap();
        task.assign_worker("W-1", "TOTE-1", &clock).unwrap();
        task.raise_exception(SkuId::from("SKU-A"), "empty_location", &clock)
            .unwrap();
        task.resolve_exception(SkuId::from("SKU-A"), LocationId::from("B-02"), &clock)
            .unwrap();
        let types: Vec<&str> = task.pending_events().iter().map(|e| e.event_type()).collect();
        assert!(types.contains(&"picking.exception_raised"));
        assert!(types.contains(&"picking.exception_resolved"));
    }

    #[test]
    fn shipment_walks_the_slam_line() {
        let clock = SystemClock;
        let mut shipment = Shipment::create("ship-ORD-1", OrderId::from("ORD-1"), &clock);
        shipment.create_batch("BATCH-1", &clock).unwrap();
        shipment.assign_lane("LANE-03", &clock).unwrap();
        shipment.confirm_sortation(&clock).unwrap();
        shipment.scan("PKG-1", &clock).unwrap();
        shipment.label("TRK-1", "UPX", &clock).unwrap();
        shipment.apply_label(&clock).unwrap();
        shipment.manifest("MAN-1", &clock).unwrap();
        shipment.confirm(chrono::Utc::now(), None, &clock).unwrap();

        assert_eq!(shipment.stage(), ShipmentStage::Confirmed);
        assert_eq!(shipment.tracking_number(), Some("TRK-1"));
        // Stage skipping is rejected; re-running the current stage is not.
        let mut fresh = Shipment::create("ship-2", OrderId::from("ORD-2"), &clock);
        assert!(fresh.scan("PKG", &clock).is_err());
        fresh.create_batch("B", &clock).unwrap();
        fresh.create_batch("B", &clock).unwrap();
        assert_eq!(fresh.stage(), ShipmentStage::Batched);
    }
}
