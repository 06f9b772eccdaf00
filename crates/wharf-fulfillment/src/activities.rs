//! Activity implementations: every durable state change the saga makes.
//!
//! Each activity loads an aggregate, applies one command, and saves it back
//! through the repository, staging the resulting events in the same storage
//! transaction. Activities are replayed by the workflow engine on retry, so
//! every one of them is idempotent: re-applying a command that already
//! committed produces no state change and no events.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use wharf_domain::{Inventory, Order, Wave};
use wharf_events::PickedItem;
use wharf_types::{
    CorrelationContext, ErrorCode, LocationId, OrderId, SkuId, WaveId, WmsError,
};
use wharf_workflow::WorkflowEngine;

use crate::aggregates::{PickTask, Shipment};
use crate::repository::AggregateRepository;

//─────────────────────────────
//  Activity inputs and outputs
//─────────────────────────────

/// Input for activities addressing one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    /// Target order.
    pub order_id: OrderId,
    /// Correlation scope for staged events.
    pub correlation: CorrelationContext,
}

/// Input for `cancelOrder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderInput {
    /// Target order.
    pub order_id: OrderId,
    /// Cancellation reason recorded on the aggregate.
    pub reason: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Output of `validateOrder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateOrderOutput {
    /// Total items on the order.
    pub item_count: u32,
    /// Whether lines span zones.
    pub multi_zone: bool,
}

/// Output of `determineProcessPath`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPathOutput {
    /// Route the order will execute on.
    pub route_id: String,
}

/// One reservation made by `allocateInventory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Reserved SKU.
    pub sku: SkuId,
    /// Location reserved at.
    pub location_id: LocationId,
    /// Units reserved.
    pub quantity: u32,
}

/// Output of `allocateInventory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationsOutput {
    /// Reservations made, one per line.
    pub allocations: Vec<Allocation>,
}

/// Input for `recordWaveAssignment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordWaveAssignmentInput {
    /// Target order.
    pub order_id: OrderId,
    /// Assigned wave.
    pub wave_id: WaveId,
    /// Scheduled wave start.
    pub scheduled_start: DateTime<Utc>,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for the `removeOrderFromWave` compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOrderFromWaveInput {
    /// Order to remove.
    pub order_id: OrderId,
    /// Wave it was planned into.
    pub wave_id: WaveId,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `createPickTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePickTaskInput {
    /// Order being picked.
    pub order_id: OrderId,
    /// Route the task belongs to.
    pub route_id: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Output of `createPickTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedOutput {
    /// Created (or pre-existing) task id.
    pub task_id: String,
}

/// Input for activities addressing one pick task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    /// Target task.
    pub task_id: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `assignPickWorker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignPickWorkerInput {
    /// Target task.
    pub task_id: String,
    /// Operator id.
    pub worker_id: String,
    /// Issued tote.
    pub tote_id: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `recordItemPicked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordItemPickedInput {
    /// Target task.
    pub task_id: String,
    /// Picked item.
    pub item: PickedItem,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `resolvePickException`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvePickExceptionInput {
    /// Target task.
    pub task_id: String,
    /// Order holding the reservation.
    pub order_id: OrderId,
    /// Problem SKU.
    pub sku: SkuId,
    /// Operator-reported reason.
    pub reason: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Output of `resolvePickException`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionResolutionOutput {
    /// Location the pick was redirected to.
    pub alternate_location: LocationId,
}

/// Input for `completePickTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePickTaskInput {
    /// Target task.
    pub task_id: String,
    /// Operator-reported outcome.
    pub success: bool,
    /// Items picked.
    pub picked: Vec<PickedItem>,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `createShipment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipmentInput {
    /// Shipment id, derived from the order.
    pub shipment_id: String,
    /// Order being shipped.
    pub order_id: OrderId,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for activities addressing one shipment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentRef {
    /// Target shipment.
    pub shipment_id: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Output of `slamLabel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlamLabelOutput {
    /// Generated tracking number.
    pub tracking_number: String,
    /// Carrier code.
    pub carrier: String,
}

/// Input for `confirmShipment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmShipmentInput {
    /// Target shipment.
    pub shipment_id: String,
    /// Hand-off instant (signal-provided or auto-confirmation time).
    pub shipped_at: DateTime<Utc>,
    /// Carrier delivery estimate, when the signal carried one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub estimated_delivery: Option<DateTime<Utc>>,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

/// Input for `markOrderShipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkOrderShippedInput {
    /// Target order.
    pub order_id: OrderId,
    /// Carrier tracking number.
    pub tracking_number: String,
    /// Carrier code.
    pub carrier: String,
    /// Correlation scope.
    pub correlation: CorrelationContext,
}

//─────────────────────────────
//  Implementations
//─────────────────────────────

/// Shared dependencies of every fulfillment activity.
pub struct FulfillmentDeps {
    repo: AggregateRepository,
}

impl FulfillmentDeps {
    /// Build the dependency bundle around a repository.
    pub fn new(repo: AggregateRepository) -> Self {
        Self { repo }
    }

    /// The repository, for callers that create aggregates outside the saga.
    pub fn repository(&self) -> &AggregateRepository {
        &self.repo
    }

    async fn validate_order(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        let order: Order = self
            .repo
            .update(input.order_id.as_str(), &input.correlation, |o: &mut Order| {
                o.validate(clock.as_ref())
            })
            .await?;
        Ok(serde_json::to_value(ValidateOrderOutput {
            item_count: order.item_count(),
            multi_zone: order.is_multi_zone(),
        })?)
    }

    async fn determine_process_path(&self, input: OrderRef) -> Result<Value> {
        let order: Order = self
            .repo
            .load(input.order_id.as_str())
            .await?
            .ok_or_else(|| WmsError::not_found(format!("order {}", input.order_id)))?;
        // Route ids are stable per order so activity retries land on the
        // same route.
        let route_id = format!("route-{}", order.id());
        Ok(serde_json::to_value(ProcessPathOutput { route_id })?)
    }

    async fn allocate_inventory(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        let order: Order = self
            .repo
            .load(input.order_id.as_str())
            .await?
            .ok_or_else(|| WmsError::not_found(format!("order {}", input.order_id)))?;

        let mut allocations = Vec::with_capacity(order.lines().len());
        for line in order.lines() {
            let order_id = order.id().clone();
            let quantity = line.quantity;
            let clock = Arc::clone(&clock);
            let inventory: Inventory = self
                .repo
                .update(line.sku.as_str(), &input.correlation, move |inv: &mut Inventory| {
                    if inv.reservation_for(&order_id).is_some() {
                        // A previous attempt already committed this line.
                        return Ok(());
                    }
                    let location = inv
                        .location_for(quantity)
                        .cloned()
                        .ok_or_else(|| {
                            WmsError::invariant(format!(
                                "no location can cover {quantity} units of {}",
                                inv.sku()
                            ))
                        })?;
                    inv.reserve(order_id.clone(), location, quantity, clock.as_ref())
                })
                .await?;
            let reservation = inventory.reservation_for(order.id()).cloned().ok_or_else(|| {
                WmsError::internal(format!("reservation vanished for {}", line.sku))
            })?;
            allocations.push(Allocation {
                sku: line.sku.clone(),
                location_id: reservation.location_id,
                quantity: reservation.quantity,
            });
        }
        Ok(serde_json::to_value(AllocationsOutput { allocations })?)
    }

    async fn release_inventory(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        let Some(order) = self.repo.load::<Order>(input.order_id.as_str()).await? else {
            return Ok(json!({ "released": 0 }));
        };
        let mut released = 0u32;
        for line in order.lines() {
            let Some(inventory) = self.repo.load::<Inventory>(line.sku.as_str()).await? else {
                continue;
            };
            if inventory.reservation_for(order.id()).is_some() {
                released += 1;
            }
            let order_id = order.id().clone();
            let clock = Arc::clone(&clock);
            self.repo
                .update::<Inventory, _>(line.sku.as_str(), &input.correlation, move |inv| {
                    inv.release(&order_id, clock.as_ref())
                })
                .await?;
        }
        Ok(json!({ "released": released }))
    }

    async fn commit_inventory(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        let order: Order = self
            .repo
            .load(input.order_id.as_str())
            .await?
            .ok_or_else(|| WmsError::not_found(format!("order {}", input.order_id)))?;
        for line in order.lines() {
            let Some(inventory) = self.repo.load::<Inventory>(line.sku.as_str()).await? else {
                continue;
            };
            if inventory.reservation_for(order.id()).is_none() {
                // Already committed by an earlier attempt.
                debug!(sku = %line.sku, order = %order.id(), "no reservation to commit");
                continue;
            }
            let order_id = order.id().clone();
            let clock = Arc::clone(&clock);
            self.repo
                .update::<Inventory, _>(line.sku.as_str(), &input.correlation, move |inv| {
                    if inv.reservation_for(&order_id).is_none() {
                        return Ok(());
                    }
                    inv.commit_reservation(&order_id, clock.as_ref())
                })
                .await?;
        }
        Ok(Value::Null)
    }

    async fn record_wave_assignment(&self, input: RecordWaveAssignmentInput) -> Result<Value> {
        let clock = self.repo.clock();
        let wave_id = input.wave_id.clone();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.assign_to_wave(wave_id.clone(), input.scheduled_start, clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn remove_order_from_wave(&self, input: RemoveOrderFromWaveInput) -> Result<Value> {
        let clock = self.repo.clock();
        if self.repo.load::<Wave>(input.wave_id.as_str()).await?.is_none() {
            return Ok(Value::Null);
        }
        let order_id = input.order_id.clone();
        let result = self
            .repo
            .update::<Wave, _>(input.wave_id.as_str(), &input.correlation, move |w| {
                w.remove_order(&order_id, clock.as_ref())
            })
            .await;
        match result {
            Ok(_) => Ok(Value::Null),
            Err(err) if err.code == ErrorCode::Conflict => {
                // The wave already released to the floor; membership is the
                // wave service's problem from here on.
                warn!(wave = %input.wave_id, order = %input.order_id, "wave past planning, skipping removal");
                Ok(Value::Null)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_pick_task(&self, input: CreatePickTaskInput) -> Result<Value> {
        let clock = self.repo.clock();
        let order: Order = self
            .repo
            .load(input.order_id.as_str())
            .await?
            .ok_or_else(|| WmsError::not_found(format!("order {}", input.order_id)))?;
        let task_id = format!("pick-{}", input.route_id);
        let build_id = task_id.clone();
        let lines = order.lines().to_vec();
        let order_id = order.id().clone();
        let route_id = input.route_id.clone();
        let task: PickTask = self
            .repo
            .create_if_absent(&task_id, &input.correlation, move || {
                PickTask::create(build_id, order_id, route_id, lines, clock.as_ref())
            })
            .await?;
        Ok(serde_json::to_value(TaskCreatedOutput {
            task_id: task.id().to_owned(),
        })?)
    }

    async fn assign_pick_worker(&self, input: AssignPickWorkerInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<PickTask, _>(&input.task_id, &input.correlation, move |t| {
                t.assign_worker(input.worker_id.clone(), input.tote_id.clone(), clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn record_item_picked(&self, input: RecordItemPickedInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<PickTask, _>(&input.task_id, &input.correlation, move |t| {
                t.record_pick(input.item.clone(), clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    /// Re-point the order's reservation at a location that still has stock,
    /// and record the exception on the task.
    async fn resolve_pick_exception(&self, input: ResolvePickExceptionInput) -> Result<Value> {
        let clock = self.repo.clock();
        let inventory: Inventory = self
            .repo
            .load(input.sku.as_str())
            .await?
            .ok_or_else(|| WmsError::not_found(format!("sku {}", input.sku)))?;
        let reservation = inventory
            .reservation_for(&input.order_id)
            .cloned()
            .ok_or_else(|| {
                WmsError::not_found(format!(
                    "no reservation for order {} on sku {}",
                    input.order_id, input.sku
                ))
            })?;
        let alternate = inventory
            .alternate_location_for(&reservation.location_id, reservation.quantity)
            .cloned()
            .ok_or_else(|| {
                WmsError::invariant(format!(
                    "no alternate location can cover sku {}",
                    input.sku
                ))
            })?;

        let order_id = input.order_id.clone();
        let alt = alternate.clone();
        let qty = reservation.quantity;
        let clock_for_inventory = Arc::clone(&clock);
        self.repo
            .update::<Inventory, _>(input.sku.as_str(), &input.correlation, move |inv| {
                inv.release(&order_id, clock_for_inventory.as_ref())?;
                inv.reserve(order_id.clone(), alt.clone(), qty, clock_for_inventory.as_ref())
            })
            .await?;

        let sku = input.sku.clone();
        let reason = input.reason.clone();
        let alt = alternate.clone();
        self.repo
            .update::<PickTask, _>(&input.task_id, &input.correlation, move |t| {
                t.raise_exception(sku.clone(), reason.clone(), clock.as_ref())?;
                t.resolve_exception(sku.clone(), alt.clone(), clock.as_ref())
            })
            .await?;

        Ok(serde_json::to_value(ExceptionResolutionOutput {
            alternate_location: alternate,
        })?)
    }

    async fn complete_pick_task(&self, input: CompletePickTaskInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<PickTask, _>(&input.task_id, &input.correlation, move |t| {
                t.complete(input.success, clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn cancel_pick_task(&self, input: TaskRef) -> Result<Value> {
        let clock = self.repo.clock();
        if self.repo.load::<PickTask>(&input.task_id).await?.is_none() {
            return Ok(Value::Null);
        }
        self.repo
            .update::<PickTask, _>(&input.task_id, &input.correlation, move |t| {
                t.cancel(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn start_order_picking(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.start_picking(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn start_consolidation(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.start_consolidation(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn start_packing(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.start_packing(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn create_shipment(&self, input: CreateShipmentInput) -> Result<Value> {
        let clock = self.repo.clock();
        let shipment_id = input.shipment_id.clone();
        let order_id = input.order_id.clone();
        self.repo
            .create_if_absent::<Shipment, _>(&input.shipment_id, &input.correlation, move || {
                Ok(Shipment::create(shipment_id, order_id, clock.as_ref()))
            })
            .await?;
        Ok(Value::Null)
    }

    async fn create_sortation_batch(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        let batch_id = format!("BATCH-{}", input.shipment_id);
        let batch = batch_id.clone();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.create_batch(batch.clone(), clock.as_ref())
            })
            .await?;
        Ok(json!({ "batch_id": batch_id }))
    }

    async fn assign_sortation_lane(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        let lane = format!("LANE-{:02}", (input.shipment_id.len() % 12) + 1);
        let assigned = lane.clone();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.assign_lane(assigned.clone(), clock.as_ref())
            })
            .await?;
        Ok(json!({ "lane": lane }))
    }

    async fn confirm_sortation(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.confirm_sortation(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn slam_scan(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        let package_id = format!("PKG-{}", input.shipment_id);
        let package = package_id.clone();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.scan(package.clone(), clock.as_ref())
            })
            .await?;
        Ok(json!({ "package_id": package_id }))
    }

    async fn slam_label(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        let tracking_number = format!("TRK-{}", input.shipment_id);
        let carrier = "UPX".to_owned();
        let tracking = tracking_number.clone();
        let carrier_code = carrier.clone();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.label(tracking.clone(), carrier_code.clone(), clock.as_ref())
            })
            .await?;
        Ok(serde_json::to_value(SlamLabelOutput {
            tracking_number,
            carrier,
        })?)
    }

    async fn slam_apply(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.apply_label(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn slam_manifest(&self, input: ShipmentRef) -> Result<Value> {
        let clock = self.repo.clock();
        let manifest_id = format!("MAN-{}", input.shipment_id);
        let manifest = manifest_id.clone();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.manifest(manifest.clone(), clock.as_ref())
            })
            .await?;
        Ok(json!({ "manifest_id": manifest_id }))
    }

    async fn confirm_shipment(&self, input: ConfirmShipmentInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Shipment, _>(&input.shipment_id, &input.correlation, move |s| {
                s.confirm(input.shipped_at, input.estimated_delivery, clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn mark_order_shipped(&self, input: MarkOrderShippedInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.mark_shipped(
                    input.tracking_number.clone(),
                    input.carrier.clone(),
                    clock.as_ref(),
                )
            })
            .await?;
        Ok(Value::Null)
    }

    async fn complete_order(&self, input: OrderRef) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.complete(clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }

    async fn cancel_order(&self, input: CancelOrderInput) -> Result<Value> {
        let clock = self.repo.clock();
        self.repo
            .update::<Order, _>(input.order_id.as_str(), &input.correlation, move |o| {
                o.cancel(input.reason.clone(), clock.as_ref())
            })
            .await?;
        Ok(Value::Null)
    }
}

/// Register every fulfillment activity on an engine.
pub fn register_activities(engine: &WorkflowEngine, deps: Arc<FulfillmentDeps>) {
    macro_rules! activity {
        ($name:literal, $method:ident) => {{
            let deps = Arc::clone(&deps);
            engine.register_activity_fn($name, move |input| {
                let deps = Arc::clone(&deps);
                async move { deps.$method(serde_json::from_value(input)?).await }
            });
        }};
    }

    activity!("validateOrder", validate_order);
    activity!("determineProcessPath", determine_process_path);
    activity!("allocateInventory", allocate_inventory);
    activity!("releaseInventory", release_inventory);
    activity!("commitInventory", commit_inventory);
    activity!("recordWaveAssignment", record_wave_assignment);
    activity!("removeOrderFromWave", remove_order_from_wave);
    activity!("createPickTask", create_pick_task);
    activity!("assignPickWorker", assign_pick_worker);
    activity!("recordItemPicked", record_item_picked);
    activity!("resolvePickException", resolve_pick_exception);
    activity!("completePickTask", complete_pick_task);
    activity!("cancelPickTask", cancel_pick_task);
    activity!("startOrderPicking", start_order_picking);
    activity!("startConsolidation", start_consolidation);
    activity!("startPacking", start_packing);
    activity!("createShipment", create_shipment);
    activity!("createSortationBatch", create_sortation_batch);
    activity!("assignSortationLane", assign_sortation_lane);
    activity!("confirmSortation", confirm_sortation);
    activity!("slamScan", slam_scan);
    activity!("slamLabel", slam_label);
    activity!("slamApply", slam_apply);
    activity!("slamManifest", slam_manifest);
    activity!("confirmShipment", confirm_shipment);
    activity!("markOrderShipped", mark_order_shipped);
    activity!("completeOrder", complete_order);
    activity!("cancelOrder", cancel_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_events::OrderLine;
    use wharf_store_memory::MemoryStore;
    use wharf_types::{CustomerId, Priority, SystemClock};

    async fn deps_with_order() -> (FulfillmentDeps, CorrelationContext) {
        let store = MemoryStore::new();
        let repo = AggregateRepository::new(
            Arc::new(store),
            "fulfillment-service",
            Arc::new(SystemClock),
        );
        let ctx = CorrelationContext::new().with_order(OrderId::from("ORD-1"));

        let mut order = Order::create(
            OrderId::from("ORD-1"),
            CustomerId::from("CUST-1"),
            Priority::Standard,
            vec![OrderLine {
                sku: "SKU-A".into(),
                quantity: 2,
                zone: None,
            }],
            &SystemClock,
        )
        .unwrap();
        repo.save(&mut order, &ctx).await.unwrap();

        let mut inventory = Inventory::new(SkuId::from("SKU-A"));
        inventory
            .receive(LocationId::from("A-01"), 10, &SystemClock)
            .unwrap();
        inventory
            .receive(LocationId::from("B-01"), 10, &SystemClock)
            .unwrap();
        repo.save(&mut inventory, &ctx).await.unwrap();

        (FulfillmentDeps::new(repo), ctx)
    }

    #[tokio::test]
    async fn allocate_is_idempotent_across_retries() {
        let (deps, ctx) = deps_with_order().await;
        let input = OrderRef {
            order_id: OrderId::from("ORD-1"),
            correlation: ctx,
        };

        deps.allocate_inventory(input.clone()).await.unwrap();
        // A retried activity attempt reserves nothing further.
        deps.allocate_inventory(input).await.unwrap();

        let inventory: Inventory = deps.repo.load("SKU-A").await.unwrap().unwrap();
        assert_eq!(inventory.reserved(), 2);
    }

    #[tokio::test]
    async fn release_after_allocate_restores_stock() {
        let (deps, ctx) = deps_with_order().await;
        let input = OrderRef {
            order_id: OrderId::from("ORD-1"),
            correlation: ctx,
        };
        deps.allocate_inventory(input.clone()).await.unwrap();
        deps.release_inventory(input.clone()).await.unwrap();
        // Compensation replays harmlessly.
        deps.release_inventory(input).await.unwrap();

        let inventory: Inventory = deps.repo.load("SKU-A").await.unwrap().unwrap();
        assert_eq!(inventory.reserved(), 0);
        assert_eq!(inventory.quantity(), 20);
    }

    #[tokio::test]
    async fn exception_resolution_moves_the_reservation() {
        let (deps, ctx) = deps_with_order().await;
        let order_ref = OrderRef {
            order_id: OrderId::from("ORD-1"),
            correlation: ctx.clone(),
        };
        deps.allocate_inventory(order_ref).await.unwrap();
        deps.create_pick_task(CreatePickTaskInput {
            order_id: OrderId::from("ORD-1"),
            route_id: "route-ORD-1".to_owned(),
            correlation: ctx.clone(),
        })
        .await
        .unwrap();
        deps.assign_pick_worker(AssignPickWorkerInput {
            task_id: "pick-route-ORD-1".to_owned(),
            worker_id: "W-1".to_owned(),
            tote_id: "TOTE-1".to_owned(),
            correlation: ctx.clone(),
        })
        .await
        .unwrap();

        let resolution = deps
            .resolve_pick_exception(ResolvePickExceptionInput {
                task_id: "pick-route-ORD-1".to_owned(),
                order_id: OrderId::from("ORD-1"),
                sku: SkuId::from("SKU-A"),
                reason: "empty_location".to_owned(),
                correlation: ctx,
            })
            .await
            .unwrap();
        let output: ExceptionResolutionOutput = serde_json::from_value(resolution).unwrap();

        let inventory: Inventory = deps.repo.load("SKU-A").await.unwrap().unwrap();
        let reservation = inventory
            .reservation_for(&OrderId::from("ORD-1"))
            .unwrap();
        // Still exactly one reservation, now at the alternate location.
        assert_eq!(inventory.reserved(), 2);
        assert_eq!(reservation.location_id, output.alternate_location);
    }

    #[tokio::test]
    async fn commit_inventory_deducts_exactly_once() {
        let (deps, ctx) = deps_with_order().await;
        let input = OrderRef {
            order_id: OrderId::from("ORD-1"),
            correlation: ctx,
        };
        deps.allocate_inventory(input.clone()).await.unwrap();
        deps.commit_inventory(input.clone()).await.unwrap();
        deps.commit_inventory(input).await.unwrap();

        let inventory: Inventory = deps.repo.load("SKU-A").await.unwrap().unwrap();
        assert_eq!(inventory.quantity(), 18);
        assert_eq!(inventory.reserved(), 0);
    }
}
