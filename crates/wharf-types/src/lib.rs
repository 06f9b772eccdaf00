#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-types** – Shared primitive data structures for Wharf.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, messaging, or storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod clock;
mod error;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{ErrorBody, ErrorCode, WmsError};

//─────────────────────────────
//  Identifier newtypes
//─────────────────────────────

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a customer order (`ORD-…`).
    OrderId
);
string_id!(
    /// Stable identifier of a picking wave (`WV-…`).
    WaveId
);
string_id!(
    /// Stock keeping unit code.
    SkuId
);
string_id!(
    /// Physical storage location within a warehouse.
    LocationId
);
string_id!(
    /// Stable identifier of a billing invoice.
    InvoiceId
);
string_id!(
    /// Identifier of a durable workflow instance.
    WorkflowId
);
string_id!(
    /// Fulfillment facility identifier.
    FacilityId
);
string_id!(
    /// Warehouse identifier within a facility.
    WarehouseId
);
string_id!(
    /// Customer account identifier.
    CustomerId
);

//─────────────────────────────
//  Order priority
//─────────────────────────────

/// Delivery promise tier attached to an order.
///
/// The tier drives the wave-assignment timeout inside the planning stage of
/// the fulfillment saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must ship the same calendar day.
    SameDay,
    /// Must ship in time for next-day delivery.
    NextDay,
    /// Regular service level.
    Standard,
}

impl Priority {
    /// How long the planning stage waits for a wave assignment before the
    /// saga gives up and compensates.
    pub fn wave_assignment_timeout(&self) -> std::time::Duration {
        match self {
            Priority::SameDay => std::time::Duration::from_secs(30 * 60),
            Priority::NextDay => std::time::Duration::from_secs(2 * 60 * 60),
            Priority::Standard => std::time::Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::SameDay => f.write_str("same_day"),
            Priority::NextDay => f.write_str("next_day"),
            Priority::Standard => f.write_str("standard"),
        }
    }
}

//─────────────────────────────
//  Correlation context
//─────────────────────────────

/// Ambient identifiers threaded through every event an operation emits.
///
/// The context is injected explicitly into repositories and activity
/// implementations; there are no process-global correlation slots. The
/// optional fields become `wms*` extension attributes on the wire envelope
/// when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// End-to-end correlation id shared by every event of one business flow.
    pub correlation_id: Uuid,
    /// Order the flow belongs to, when known.
    pub order_id: Option<OrderId>,
    /// Wave number, once the order has been assigned.
    pub wave_number: Option<WaveId>,
    /// Root workflow instance driving the flow.
    pub workflow_id: Option<WorkflowId>,
    /// Originating facility.
    pub facility_id: Option<FacilityId>,
    /// Originating warehouse.
    pub warehouse_id: Option<WarehouseId>,
}

impl CorrelationContext {
    /// Start a fresh correlation scope with a newly minted id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            order_id: None,
            wave_number: None,
            workflow_id: None,
            facility_id: None,
            warehouse_id: None,
        }
    }

    /// Attach the order this flow operates on.
    pub fn with_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    /// Attach the wave the order was planned into.
    pub fn with_wave(mut self, wave: WaveId) -> Self {
        self.wave_number = Some(wave);
        self
    }

    /// Attach the root workflow instance.
    pub fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}
