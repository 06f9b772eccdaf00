#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-events** – Domain event model and wire envelope for Wharf.
//!
//! This crate defines the closed set of domain events each bounded context
//! can emit, the CloudEvents v1.0 envelope they travel in, and the topic
//! registry mapping event domains onto bus topics. Events are modeled as
//! tagged unions; every payload is a closed record of fields, never a bag of
//! arbitrary values.

mod domain_events;
mod envelope;
mod topics;

pub use domain_events::{
    AggregateType, DomainEvent, DomainEventPayload, EventDomain, InventoryEvent, InvoiceEvent,
    OrderEvent, OrderLine, PickedItem, PickingEvent, ShippingEvent, SortedItem, WallingEvent,
    WaveEvent, WesEvent,
};
pub use envelope::{CloudEvent, EnvelopeError, SPEC_VERSION};
pub use topics::Topic;
