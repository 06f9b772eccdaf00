//! Topic registry: one bus topic per bounded context.

use serde::{Deserialize, Serialize};

/// Every topic Wharf services publish or subscribe to.
///
/// Partitioning key on every topic is the aggregate id, which is what
/// preserves per-aggregate ordering end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Order lifecycle events.
    Orders,
    /// Wave planning events.
    Waves,
    /// Picking floor events.
    Picking,
    /// Packing station events.
    Packing,
    /// Outbound shipping events.
    Shipping,
    /// Inventory ledger events.
    Inventory,
    /// Labor management events.
    Labor,
    /// Seller portal events.
    Sellers,
    /// Billing events.
    Billing,
    /// Sales channel events.
    Channels,
    /// Warehouse execution events.
    Wes,
    /// Put-wall events.
    Walling,
}

impl Topic {
    /// Canonical topic name on the bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Orders => "wms.orders.events",
            Topic::Waves => "wms.waves.events",
            Topic::Picking => "wms.picking.events",
            Topic::Packing => "wms.packing.events",
            Topic::Shipping => "wms.shipping.events",
            Topic::Inventory => "wms.inventory.events",
            Topic::Labor => "wms.labor.events",
            Topic::Sellers => "wms.sellers.events",
            Topic::Billing => "wms.billing.events",
            Topic::Channels => "wms.channels.events",
            Topic::Wes => "wms.wes.events",
            Topic::Walling => "wms.walling.events",
        }
    }

    /// All registered topics.
    pub fn all() -> &'static [Topic] {
        &[
            Topic::Orders,
            Topic::Waves,
            Topic::Picking,
            Topic::Packing,
            Topic::Shipping,
            Topic::Inventory,
            Topic::Labor,
            Topic::Sellers,
            Topic::Billing,
            Topic::Channels,
            Topic::Wes,
            Topic::Walling,
        ]
    }

    /// Dead-letter companion topic for consumer-side diversion.
    pub fn dead_letter(&self) -> String {
        format!("{}.dlq", self.as_str())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_complete() {
        assert_eq!(Topic::all().len(), 12);
        assert!(Topic::all().iter().any(|t| t.as_str() == "wms.walling.events"));
    }

    #[test]
    fn dead_letter_suffix() {
        assert_eq!(Topic::Orders.dead_letter(), "wms.orders.events.dlq");
    }
}
