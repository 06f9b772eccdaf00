#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-fulfillment** – The order-fulfillment saga family for Wharf.
//!
//! The root saga drives an order from validation through planning, warehouse
//! execution, sortation and SLAM shipping to completion, compensating
//! (release reservations, remove wave references, cancel pick tasks) when a
//! stage fails or times out. Operator input arrives as signals on the
//! channels in [`signals`]; every durable state change happens inside an
//! activity that loads, mutates and saves an aggregate through the
//! transactional-outbox repository.

mod activities;
mod aggregates;
mod repository;
mod signals;
mod workflows;

pub use activities::{register_activities, FulfillmentDeps};
pub use aggregates::{PickTask, PickTaskStatus, Shipment, ShipmentStage};
pub use repository::AggregateRepository;
pub use signals::{channels, timeouts, ConsolidationCompleteSignal, ItemConsolidatedSignal,
    ItemPickedSignal, ItemVerifiedSignal, LabelAppliedSignal, PackageSealedSignal,
    PackerAssignedSignal, PackingCompleteSignal, PickExceptionSignal, PickingCompleteSignal,
    ShipConfirmedSignal, StationAssignedSignal, ToteArrivedSignal, WallingCompletedSignal,
    WaveAssignedSignal, WorkerAssignedSignal,
};
pub use workflows::{
    register_workflows, root_workflow_id, FulfillmentInput, FulfillmentSummary,
    OrderFulfillmentWorkflow, PlanningWorkflow, RouteTemplate, ShippingWorkflow,
    WesExecutionWorkflow,
};

/// Register the whole saga family (workflows and activities) on an engine.
pub fn register(
    engine: &wharf_workflow::WorkflowEngine,
    deps: std::sync::Arc<FulfillmentDeps>,
) {
    register_activities(engine, deps);
    register_workflows(engine);
}
