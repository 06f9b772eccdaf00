//! The saga family: root fulfillment workflow and its children.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use wharf_types::{CorrelationContext, OrderId, Priority, WaveId, WorkflowId};
use wharf_workflow::{
    ActivityOptions, SignalOrTimeout, Workflow, WorkflowCtx, WorkflowEngine, WorkflowError,
    WorkflowResult,
};
use wharf_resilience::RetryPolicy;

use crate::activities::{
    AssignPickWorkerInput, CancelOrderInput, CompletePickTaskInput, ConfirmShipmentInput,
    CreatePickTaskInput, CreateShipmentInput, MarkOrderShippedInput, OrderRef,
    ProcessPathOutput, RecordItemPickedInput, RecordWaveAssignmentInput,
    RemoveOrderFromWaveInput, ResolvePickExceptionInput, ShipmentRef, SlamLabelOutput,
    TaskCreatedOutput, TaskRef, ValidateOrderOutput,
};
use crate::signals::{
    channels, timeouts, ItemPickedSignal, PackageSealedSignal, PackingCompleteSignal,
    PickExceptionSignal, PickingCompleteSignal, ShipConfirmedSignal, WallingCompletedSignal,
    WaveAssignedSignal, WorkerAssignedSignal,
};

//─────────────────────────────
//  Inputs, outputs, templates
//─────────────────────────────

/// Workflow id convention for the root saga.
pub fn root_workflow_id(order_id: &OrderId) -> WorkflowId {
    WorkflowId(format!("order-fulfillment-{order_id}"))
}

/// Parameters of the root saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentInput {
    /// Order to fulfill.
    pub order_id: OrderId,
    /// Service tier, drives the wave-assignment timeout.
    pub priority: Priority,
    /// Total items on the order.
    pub item_count: u32,
    /// Whether lines span zones.
    pub multi_zone: bool,
    /// Correlation scope shared with the order-creation command.
    pub correlation: CorrelationContext,
}

/// Terminal output of a successful saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentSummary {
    /// Fulfilled order.
    pub order_id: OrderId,
    /// Carrier tracking number.
    pub tracking_number: String,
    /// Carrier code.
    pub carrier: String,
    /// Execution template the order ran on.
    pub template: RouteTemplate,
}

/// Warehouse execution templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTemplate {
    /// 1-3 items, single zone: straight to packing.
    PickPack,
    /// 4-20 items, single zone: sorted through the put-wall.
    PickWallPack,
    /// Multi-zone (or oversized) orders: totes consolidated before packing.
    PickConsolidatePack,
}

impl RouteTemplate {
    /// Template selection by item count and zone spread.
    pub fn select(item_count: u32, multi_zone: bool) -> Self {
        if multi_zone {
            RouteTemplate::PickConsolidatePack
        } else if item_count <= 3 {
            RouteTemplate::PickPack
        } else if item_count <= 20 {
            RouteTemplate::PickWallPack
        } else {
            // Beyond put-wall capacity; consolidate instead.
            RouteTemplate::PickConsolidatePack
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanningInput {
    order_id: OrderId,
    priority: Priority,
    correlation: CorrelationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanningOutput {
    wave_id: WaveId,
    scheduled_start: chrono::DateTime<chrono::Utc>,
    route_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WesInput {
    order_id: OrderId,
    route_id: String,
    template: RouteTemplate,
    correlation: CorrelationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WesOutput {
    template: RouteTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PickingInput {
    order_id: OrderId,
    route_id: String,
    correlation: CorrelationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PickingOutput {
    picked_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RouteStageInput {
    order_id: OrderId,
    route_id: String,
    correlation: CorrelationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShippingInput {
    order_id: OrderId,
    shipment_id: String,
    correlation: CorrelationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShippingOutput {
    tracking_number: String,
    carrier: String,
}

fn parse<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(input).map_err(|e| WorkflowError::Internal(e.to_string()))
}

fn render<T: Serialize>(output: &T) -> WorkflowResult {
    serde_json::to_value(output).map_err(|e| WorkflowError::Internal(e.to_string()))
}

//─────────────────────────────
//  Root saga
//─────────────────────────────

/// The root order-fulfillment saga.
///
/// Stages run in order: validate, plan (child), execute (child), sortation,
/// ship (child), complete. A stage failure cancels the order with a typed
/// reason and lets the engine unwind the compensation stack.
pub struct OrderFulfillmentWorkflow;

#[async_trait]
impl Workflow for OrderFulfillmentWorkflow {
    fn name(&self) -> &str {
        "order_fulfillment"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let input: FulfillmentInput = parse(input)?;
        let order_id = input.order_id.clone();
        let correlation = input
            .correlation
            .clone()
            .with_order(order_id.clone())
            .with_workflow(WorkflowId::from(ctx.workflow_id()));
        let order_ref = OrderRef {
            order_id: order_id.clone(),
            correlation: correlation.clone(),
        };

        // Stage 1: validate.
        let validated: ValidateOrderOutput = match ctx
            .activity_with(
                "validateOrder",
                &order_ref,
                ActivityOptions {
                    retry: RetryPolicy::standard(),
                    ..ActivityOptions::default()
                },
            )
            .await
        {
            Ok(output) => output,
            Err(err) => {
                self.cancel_order(&mut ctx, &order_id, &correlation, "validation_failed")
                    .await;
                return Err(err);
            }
        };

        // Stage 2: planning and wave assignment.
        let planning: PlanningOutput = match ctx
            .child(
                "planning",
                &format!("planning-{order_id}"),
                &PlanningInput {
                    order_id: order_id.clone(),
                    priority: input.priority,
                    correlation: correlation.clone(),
                },
            )
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let reason = match &err {
                    WorkflowError::ChildFailed { reason, .. } if reason.contains("timed out") => {
                        "wave_timeout"
                    }
                    _ => "planning_failed",
                };
                self.cancel_order(&mut ctx, &order_id, &correlation, reason).await;
                return Err(err);
            }
        };
        // From here real state exists outside the saga; arm the unwind.
        ctx.push_compensation("releaseInventory", &order_ref)?;
        ctx.push_compensation(
            "removeOrderFromWave",
            &RemoveOrderFromWaveInput {
                order_id: order_id.clone(),
                wave_id: planning.wave_id.clone(),
                correlation: correlation.clone(),
            },
        )?;
        let correlation = correlation.with_wave(planning.wave_id.clone());
        let order_ref = OrderRef {
            order_id: order_id.clone(),
            correlation: correlation.clone(),
        };

        // Stage 3: warehouse execution.
        let template = RouteTemplate::select(validated.item_count, validated.multi_zone);
        let _wes: WesOutput = match ctx
            .child(
                "wes_execution",
                &format!("wes-{order_id}"),
                &WesInput {
                    order_id: order_id.clone(),
                    route_id: planning.route_id.clone(),
                    template,
                    correlation: correlation.clone(),
                },
            )
            .await
        {
            Ok(output) => output,
            Err(err) => {
                self.cancel_order(&mut ctx, &order_id, &correlation, "execution_failed")
                    .await;
                return Err(err);
            }
        };

        // Stage 4: sortation.
        let shipment_id = format!("ship-{order_id}");
        let shipment_ref = ShipmentRef {
            shipment_id: shipment_id.clone(),
            correlation: correlation.clone(),
        };
        let _: Value = ctx
            .activity(
                "createShipment",
                &CreateShipmentInput {
                    shipment_id: shipment_id.clone(),
                    order_id: order_id.clone(),
                    correlation: correlation.clone(),
                },
            )
            .await?;
        let _: Value = ctx.activity("createSortationBatch", &shipment_ref).await?;
        let _: Value = ctx.activity("assignSortationLane", &shipment_ref).await?;
        let _: Value = ctx.activity("confirmSortation", &shipment_ref).await?;

        // Stage 5: shipping (SLAM).
        let shipping: ShippingOutput = match ctx
            .child(
                "shipping",
                &format!("shipping-{order_id}"),
                &ShippingInput {
                    order_id: order_id.clone(),
                    shipment_id,
                    correlation: correlation.clone(),
                },
            )
            .await
        {
            Ok(output) => output,
            Err(err) => {
                self.cancel_order(&mut ctx, &order_id, &correlation, "shipping_failed")
                    .await;
                return Err(err);
            }
        };

        // Stage 6: completion.
        let _: Value = ctx
            .activity(
                "markOrderShipped",
                &MarkOrderShippedInput {
                    order_id: order_id.clone(),
                    tracking_number: shipping.tracking_number.clone(),
                    carrier: shipping.carrier.clone(),
                    correlation: correlation.clone(),
                },
            )
            .await?;
        let _: Value = ctx.activity("commitInventory", &order_ref).await?;
        let _: Value = ctx.activity("completeOrder", &order_ref).await?;

        info!(order = %order_id, "order fulfilled");
        render(&FulfillmentSummary {
            order_id,
            tracking_number: shipping.tracking_number,
            carrier: shipping.carrier,
            template,
        })
    }
}

impl OrderFulfillmentWorkflow {
    /// Best-effort order cancellation on stage failure. The saga still
    /// terminates failed; an unreachable store at this point is logged, not
    /// fatal to the unwind.
    async fn cancel_order(
        &self,
        ctx: &mut WorkflowCtx,
        order_id: &OrderId,
        correlation: &CorrelationContext,
        reason: &str,
    ) {
        let result: Result<Value, WorkflowError> = ctx
            .activity_with(
                "cancelOrder",
                &CancelOrderInput {
                    order_id: order_id.clone(),
                    reason: reason.to_owned(),
                    correlation: correlation.clone(),
                },
                ActivityOptions {
                    retry: RetryPolicy::aggressive(),
                    ..ActivityOptions::default()
                },
            )
            .await;
        if let Err(err) = result {
            warn!(order = %order_id, reason, error = %err, "order cancellation failed");
        }
    }
}

//─────────────────────────────
//  Planning
//─────────────────────────────

/// Determine the process path, allocate inventory, await the wave planner.
pub struct PlanningWorkflow;

#[async_trait]
impl Workflow for PlanningWorkflow {
    fn name(&self) -> &str {
        "planning"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let input: PlanningInput = parse(input)?;
        let order_ref = OrderRef {
            order_id: input.order_id.clone(),
            correlation: input.correlation.clone(),
        };

        let path: ProcessPathOutput = ctx.activity("determineProcessPath", &order_ref).await?;
        let _: Value = ctx.activity("allocateInventory", &order_ref).await?;
        // Reservations exist now; if planning dies the engine releases them.
        ctx.push_compensation("releaseInventory", &order_ref)?;

        let timeout = input.priority.wave_assignment_timeout();
        match ctx
            .signal_or_timer::<WaveAssignedSignal>(channels::WAVE_ASSIGNED, timeout)
            .await?
        {
            SignalOrTimeout::Signal(wave) => {
                let _: Value = ctx
                    .activity(
                        "recordWaveAssignment",
                        &RecordWaveAssignmentInput {
                            order_id: input.order_id,
                            wave_id: wave.wave_id.clone(),
                            scheduled_start: wave.scheduled_start,
                            correlation: input.correlation,
                        },
                    )
                    .await?;
                render(&PlanningOutput {
                    wave_id: wave.wave_id,
                    scheduled_start: wave.scheduled_start,
                    route_id: path.route_id,
                })
            }
            SignalOrTimeout::Timeout => Err(WorkflowError::Timeout(format!(
                "wave assignment timed out after {timeout:?}"
            ))),
        }
    }
}

//─────────────────────────────
//  Warehouse execution
//─────────────────────────────

/// Execute the selected route template.
pub struct WesExecutionWorkflow;

#[async_trait]
impl Workflow for WesExecutionWorkflow {
    fn name(&self) -> &str {
        "wes_execution"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let input: WesInput = parse(input)?;
        let order_ref = OrderRef {
            order_id: input.order_id.clone(),
            correlation: input.correlation.clone(),
        };
        let stage_input = RouteStageInput {
            order_id: input.order_id.clone(),
            route_id: input.route_id.clone(),
            correlation: input.correlation.clone(),
        };

        let _: Value = ctx.activity("startOrderPicking", &order_ref).await?;
        let _: PickingOutput = ctx
            .child(
                "picking",
                &format!("picking-{}", input.route_id),
                &PickingInput {
                    order_id: input.order_id.clone(),
                    route_id: input.route_id.clone(),
                    correlation: input.correlation.clone(),
                },
            )
            .await?;

        match input.template {
            RouteTemplate::PickPack => {}
            RouteTemplate::PickWallPack => {
                let _: Value = ctx
                    .child("walling", &format!("walling-{}", input.route_id), &stage_input)
                    .await?;
            }
            RouteTemplate::PickConsolidatePack => {
                let _: Value = ctx.activity("startConsolidation", &order_ref).await?;
                let _: Value = ctx
                    .child(
                        "consolidation",
                        &format!("consolidation-{}", input.route_id),
                        &stage_input,
                    )
                    .await?;
            }
        }

        let _: Value = ctx.activity("startPacking", &order_ref).await?;
        let _: Value = ctx
            .child("packing", &format!("packing-{}", input.route_id), &stage_input)
            .await?;

        render(&WesOutput {
            template: input.template,
        })
    }
}

//─────────────────────────────
//  Picking
//─────────────────────────────

/// One pick task driven by handheld signals, with exception rerouting.
pub struct PickingWorkflow;

#[async_trait]
impl Workflow for PickingWorkflow {
    fn name(&self) -> &str {
        "picking"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let input: PickingInput = parse(input)?;
        let created: TaskCreatedOutput = ctx
            .activity(
                "createPickTask",
                &CreatePickTaskInput {
                    order_id: input.order_id.clone(),
                    route_id: input.route_id.clone(),
                    correlation: input.correlation.clone(),
                },
            )
            .await?;
        let task_id = created.task_id;
        ctx.push_compensation(
            "cancelPickTask",
            &TaskRef {
                task_id: task_id.clone(),
                correlation: input.correlation.clone(),
            },
        )?;

        match ctx
            .signal_or_timer::<WorkerAssignedSignal>(
                channels::WORKER_ASSIGNED,
                timeouts::WORKER_ASSIGNED,
            )
            .await?
        {
            SignalOrTimeout::Timeout => {
                return Err(WorkflowError::Timeout(
                    "no operator claimed the pick task".to_owned(),
                ))
            }
            SignalOrTimeout::Signal(worker) => {
                let _: Value = ctx
                    .activity(
                        "assignPickWorker",
                        &AssignPickWorkerInput {
                            task_id: task_id.clone(),
                            worker_id: worker.worker_id,
                            tote_id: worker.tote_id,
                            correlation: input.correlation.clone(),
                        },
                    )
                    .await?;
            }
        }

        // Exceptions drain before item scans; completion drains last so
        // buffered picks are all recorded first.
        let pick_channels = [
            channels::PICK_EXCEPTION,
            channels::ITEM_PICKED,
            channels::PICKING_COMPLETE,
        ];
        let mut picked_items = 0usize;
        loop {
            match ctx.signals_or_timer(&pick_channels, timeouts::PICKING).await? {
                SignalOrTimeout::Timeout => {
                    return Err(WorkflowError::Timeout("picking timed out".to_owned()))
                }
                SignalOrTimeout::Signal((channel, payload)) => match channel.as_str() {
                    c if c == channels::PICK_EXCEPTION => {
                        let exception: PickExceptionSignal = parse(payload)?;
                        let _: Value = ctx
                            .activity(
                                "resolvePickException",
                                &ResolvePickExceptionInput {
                                    task_id: task_id.clone(),
                                    order_id: input.order_id.clone(),
                                    sku: exception.sku,
                                    reason: exception.reason,
                                    correlation: input.correlation.clone(),
                                },
                            )
                            .await?;
                    }
                    c if c == channels::ITEM_PICKED => {
                        let item: ItemPickedSignal = parse(payload)?;
                        picked_items += 1;
                        let _: Value = ctx
                            .activity(
                                "recordItemPicked",
                                &RecordItemPickedInput {
                                    task_id: task_id.clone(),
                                    item: item.into(),
                                    correlation: input.correlation.clone(),
                                },
                            )
                            .await?;
                    }
                    c if c == channels::PICKING_COMPLETE => {
                        let done: PickingCompleteSignal = parse(payload)?;
                        let _: Value = ctx
                            .activity(
                                "completePickTask",
                                &CompletePickTaskInput {
                                    task_id: task_id.clone(),
                                    success: done.success,
                                    picked: done.picked,
                                    correlation: input.correlation.clone(),
                                },
                            )
                            .await?;
                        if !done.success {
                            return Err(WorkflowError::Aborted {
                                reason: "operator reported picking failure".to_owned(),
                            });
                        }
                        return render(&PickingOutput { picked_items });
                    }
                    other => {
                        return Err(WorkflowError::Internal(format!(
                            "unexpected signal channel {other}"
                        )))
                    }
                },
            }
        }
    }
}

//─────────────────────────────
//  Walling, consolidation, packing
//─────────────────────────────

/// Put-wall sort stage.
pub struct WallingWorkflow;

#[async_trait]
impl Workflow for WallingWorkflow {
    fn name(&self) -> &str {
        "walling"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let _input: RouteStageInput = parse(input)?;
        match ctx
            .signal_or_timer::<WallingCompletedSignal>(
                channels::WALLING_COMPLETED,
                timeouts::WALLING,
            )
            .await?
        {
            SignalOrTimeout::Timeout => Err(WorkflowError::Timeout(
                "put-wall sort timed out".to_owned(),
            )),
            SignalOrTimeout::Signal(done) if done.success => render(&done),
            SignalOrTimeout::Signal(_) => Err(WorkflowError::Aborted {
                reason: "put-wall reported sort failure".to_owned(),
            }),
        }
    }
}

/// Multi-zone tote consolidation stage.
pub struct ConsolidationWorkflow;

#[async_trait]
impl Workflow for ConsolidationWorkflow {
    fn name(&self) -> &str {
        "consolidation"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let _input: RouteStageInput = parse(input)?;
        // Floor telemetry (totes, station, per-item moves) flows through but
        // requires no durable writes; the station's completion signal decides
        // the stage.
        let consolidation_channels = [
            channels::TOTE_ARRIVED,
            channels::STATION_ASSIGNED,
            channels::ITEM_CONSOLIDATED,
            channels::CONSOLIDATION_COMPLETE,
        ];
        loop {
            match ctx
                .signals_or_timer(&consolidation_channels, timeouts::CONSOLIDATION)
                .await?
            {
                SignalOrTimeout::Timeout => {
                    return Err(WorkflowError::Timeout(
                        "consolidation timed out".to_owned(),
                    ))
                }
                SignalOrTimeout::Signal((channel, payload)) => {
                    if channel == channels::CONSOLIDATION_COMPLETE {
                        let done: crate::signals::ConsolidationCompleteSignal = parse(payload)?;
                        if !done.success {
                            return Err(WorkflowError::Aborted {
                                reason: "station reported consolidation failure".to_owned(),
                            });
                        }
                        return Ok(Value::Null);
                    }
                }
            }
        }
    }
}

/// Packing station stage.
pub struct PackingWorkflow;

#[async_trait]
impl Workflow for PackingWorkflow {
    fn name(&self) -> &str {
        "packing"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let _input: RouteStageInput = parse(input)?;
        if let SignalOrTimeout::Timeout = ctx
            .signal_or_timer::<crate::signals::PackerAssignedSignal>(
                channels::PACKER_ASSIGNED,
                timeouts::PACKER_ASSIGNED,
            )
            .await?
        {
            return Err(WorkflowError::Timeout(
                "no packer claimed the order".to_owned(),
            ));
        }

        let packing_channels = [
            channels::ITEM_VERIFIED,
            channels::PACKAGE_SEALED,
            channels::LABEL_APPLIED,
            channels::PACKING_COMPLETE,
        ];
        let mut package_id: Option<String> = None;
        loop {
            match ctx
                .signals_or_timer(&packing_channels, timeouts::PACKING_COMPLETE)
                .await?
            {
                SignalOrTimeout::Timeout => {
                    return Err(WorkflowError::Timeout("packing timed out".to_owned()))
                }
                SignalOrTimeout::Signal((channel, payload)) => match channel.as_str() {
                    c if c == channels::PACKAGE_SEALED => {
                        let sealed: PackageSealedSignal = parse(payload)?;
                        package_id = Some(sealed.package_id);
                    }
                    c if c == channels::PACKING_COMPLETE => {
                        let done: PackingCompleteSignal = parse(payload)?;
                        if !done.success {
                            return Err(WorkflowError::Aborted {
                                reason: "packer reported failure".to_owned(),
                            });
                        }
                        return Ok(serde_json::json!({ "package_id": package_id }));
                    }
                    // itemVerified and labelApplied are telemetry here.
                    _ => {}
                },
            }
        }
    }
}

//─────────────────────────────
//  Shipping (SLAM)
//─────────────────────────────

/// Scan, label, apply, manifest, then confirm by signal or on a timer.
pub struct ShippingWorkflow;

#[async_trait]
impl Workflow for ShippingWorkflow {
    fn name(&self) -> &str {
        "shipping"
    }

    async fn run(&self, mut ctx: WorkflowCtx, input: Value) -> WorkflowResult {
        let input: ShippingInput = parse(input)?;
        let shipment_ref = ShipmentRef {
            shipment_id: input.shipment_id.clone(),
            correlation: input.correlation.clone(),
        };

        let _: Value = ctx.activity("slamScan", &shipment_ref).await?;
        let label: SlamLabelOutput = ctx.activity("slamLabel", &shipment_ref).await?;
        let _: Value = ctx.activity("slamApply", &shipment_ref).await?;
        let _: Value = ctx.activity("slamManifest", &shipment_ref).await?;

        let confirmation = match ctx
            .signal_or_timer::<ShipConfirmedSignal>(channels::SHIP_CONFIRMED, timeouts::SHIP_CONFIRM)
            .await?
        {
            SignalOrTimeout::Signal(signal) => signal,
            SignalOrTimeout::Timeout => {
                // Manifested and unchallenged: auto-confirm.
                ShipConfirmedSignal {
                    shipped_at: ctx.now().await?,
                    estimated_delivery: None,
                }
            }
        };
        let _: Value = ctx
            .activity(
                "confirmShipment",
                &ConfirmShipmentInput {
                    shipment_id: input.shipment_id,
                    shipped_at: confirmation.shipped_at,
                    estimated_delivery: confirmation.estimated_delivery,
                    correlation: input.correlation,
                },
            )
            .await?;

        render(&ShippingOutput {
            tracking_number: label.tracking_number,
            carrier: label.carrier,
        })
    }
}

/// Register the whole workflow family on an engine.
pub fn register_workflows(engine: &WorkflowEngine) {
    engine.register_workflow(std::sync::Arc::new(OrderFulfillmentWorkflow));
    engine.register_workflow(std::sync::Arc::new(PlanningWorkflow));
    engine.register_workflow(std::sync::Arc::new(WesExecutionWorkflow));
    engine.register_workflow(std::sync::Arc::new(PickingWorkflow));
    engine.register_workflow(std::sync::Arc::new(WallingWorkflow));
    engine.register_workflow(std::sync::Arc::new(ConsolidationWorkflow));
    engine.register_workflow(std::sync::Arc::new(PackingWorkflow));
    engine.register_workflow(std::sync::Arc::new(ShippingWorkflow));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_selection_matrix() {
        assert_eq!(RouteTemplate::select(1, false), RouteTemplate::PickPack);
        assert_eq!(RouteTemplate::select(3, false), RouteTemplate::PickPack);
        assert_eq!(RouteTemplate::select(4, false), RouteTemplate::PickWallPack);
        assert_eq!(RouteTemplate::select(20, false), RouteTemplate::PickWallPack);
        assert_eq!(
            RouteTemplate::select(21, false),
            RouteTemplate::PickConsolidatePack
        );
        // Multi-zone always consolidates, regardless of size.
        assert_eq!(
            RouteTemplate::select(2, true),
            RouteTemplate::PickConsolidatePack
        );
    }

    #[test]
    fn root_workflow_id_convention() {
        assert_eq!(
            root_workflow_id(&OrderId::from("ORD-1")).as_str(),
            "order-fulfillment-ORD-1"
        );
    }
}
