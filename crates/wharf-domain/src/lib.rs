#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-domain** – Write-model aggregates for Wharf.
//!
//! Every aggregate follows the same contract: command methods validate
//! invariants against current state, and on success mutate the aggregate and
//! append domain events to a private buffer. A failed command leaves the
//! aggregate untouched. No I/O happens inside a command; timestamps come from
//! an injected [`Clock`](wharf_types::Clock). The persistence layer drains
//! the buffer with [`Aggregate::take_events`] after the storage transaction
//! commits.

use serde::de::DeserializeOwned;
use serde::Serialize;

use wharf_events::{AggregateType, DomainEvent};

mod inventory;
mod invoice;
mod order;
mod wave;

pub use inventory::{Inventory, LocationStock, Reservation};
pub use invoice::{Invoice, InvoiceLine, InvoiceStatus};
pub use order::{Order, OrderStatus};
pub use wave::{Wave, WaveStatus};

//─────────────────────────────
//  Aggregate contract
//─────────────────────────────

/// Consistency boundary with a private buffer of uncommitted events.
///
/// Implementations are plain serde-serializable state; the buffer itself is
/// never persisted (`#[serde(skip)]` on the field), so a freshly loaded
/// aggregate always starts with an empty buffer.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag used in storage and outbox rows.
    fn aggregate_type() -> AggregateType
    where
        Self: Sized;

    /// Stable aggregate identifier.
    fn aggregate_id(&self) -> String;

    /// Last persisted version, used for optimistic concurrency.
    fn version(&self) -> u64;

    /// Record the version assigned by the persistence layer.
    fn set_version(&mut self, version: u64);

    /// Events appended by commands since the last save.
    fn pending_events(&self) -> &[DomainEvent];

    /// Drain the buffer. Called by the persistence layer after commit.
    fn take_events(&mut self) -> Vec<DomainEvent>;
}
