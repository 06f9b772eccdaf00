//! Signal channels, payloads and stage timeouts.
//!
//! Payload field names are camelCase on the wire; they originate from
//! handhelds, stations, the conveyor and the wave planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wharf_events::{PickedItem, SortedItem};
use wharf_types::{LocationId, SkuId, WaveId};

/// Signal channel names, as addressed by external services.
pub mod channels {
    /// Wave planner assigned the order to a wave.
    pub const WAVE_ASSIGNED: &str = "waveAssigned";
    /// Handheld: operator claimed the pick task.
    pub const WORKER_ASSIGNED: &str = "workerAssigned";
    /// Handheld: one item picked.
    pub const ITEM_PICKED: &str = "itemPicked";
    /// Handheld: pick exception raised.
    pub const PICK_EXCEPTION: &str = "pickException";
    /// Handheld: picking finished.
    pub const PICKING_COMPLETE: &str = "pickingComplete";
    /// Conveyor: tote arrived at consolidation.
    pub const TOTE_ARRIVED: &str = "toteArrived";
    /// Station: consolidation station assigned.
    pub const STATION_ASSIGNED: &str = "stationAssigned";
    /// Station: one item moved to the destination bin.
    pub const ITEM_CONSOLIDATED: &str = "itemConsolidated";
    /// Station: consolidation finished.
    pub const CONSOLIDATION_COMPLETE: &str = "consolidationComplete";
    /// Handheld: packer claimed the order.
    pub const PACKER_ASSIGNED: &str = "packerAssigned";
    /// Handheld: item verified at the packing station.
    pub const ITEM_VERIFIED: &str = "itemVerified";
    /// Handheld: package sealed.
    pub const PACKAGE_SEALED: &str = "packageSealed";
    /// Handheld: label applied at the station.
    pub const LABEL_APPLIED: &str = "labelApplied";
    /// Handheld: packing finished.
    pub const PACKING_COMPLETE: &str = "packingComplete";
    /// Put-wall: wall task finished.
    pub const WALLING_COMPLETED: &str = "wallingCompleted";
    /// SLAM or carrier: shipment confirmed.
    pub const SHIP_CONFIRMED: &str = "shipConfirmed";
}

/// Stage timeouts from the signal matrix.
pub mod timeouts {
    use std::time::Duration;

    /// Waiting for an operator to claim a pick task.
    pub const WORKER_ASSIGNED: Duration = Duration::from_secs(30 * 60);
    /// Parent picking timeout covering item scans and completion.
    pub const PICKING: Duration = Duration::from_secs(30 * 60);
    /// Waiting for totes and station work at consolidation.
    pub const CONSOLIDATION: Duration = Duration::from_secs(30 * 60);
    /// Waiting for a packer.
    pub const PACKER_ASSIGNED: Duration = Duration::from_secs(20 * 60);
    /// Packing station work.
    pub const PACKING_COMPLETE: Duration = Duration::from_secs(60 * 60);
    /// Put-wall sort.
    pub const WALLING: Duration = Duration::from_secs(15 * 60);
    /// Grace before a manifested shipment auto-confirms.
    pub const SHIP_CONFIRM: Duration = Duration::from_secs(10 * 60);
}

/// `waveAssigned` payload from the wave planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveAssignedSignal {
    /// Assigned wave.
    pub wave_id: WaveId,
    /// Scheduled wave start.
    pub scheduled_start: DateTime<Utc>,
}

/// `workerAssigned` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssignedSignal {
    /// Operator id.
    pub worker_id: String,
    /// Tote issued to the operator.
    pub tote_id: String,
}

/// `itemPicked` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPickedSignal {
    /// SKU picked.
    pub sku: SkuId,
    /// Source location.
    pub location_id: LocationId,
    /// Quantity picked.
    pub quantity: u32,
    /// Destination tote.
    pub tote_id: String,
}

impl From<ItemPickedSignal> for PickedItem {
    fn from(signal: ItemPickedSignal) -> Self {
        PickedItem {
            sku: signal.sku,
            location_id: signal.location_id,
            quantity: signal.quantity,
            tote_id: signal.tote_id,
        }
    }
}

/// `pickException` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickExceptionSignal {
    /// Problem SKU.
    pub sku: SkuId,
    /// Operator-reported reason (`empty_location`, `damaged`, …).
    pub reason: String,
    /// Units the operator could still see, if any.
    pub available: u32,
}

/// `pickingComplete` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingCompleteSignal {
    /// Whether every line was picked.
    pub success: bool,
    /// Items picked.
    pub picked: Vec<PickedItem>,
}

/// `toteArrived` payload from the conveyor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToteArrivedSignal {
    /// Arriving tote.
    pub tote_id: String,
    /// Route the tote belongs to.
    pub route_id: String,
}

/// `stationAssigned` payload from a consolidation station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationAssignedSignal {
    /// Station code.
    pub station: String,
    /// Operator id.
    pub worker_id: String,
    /// Destination bin for the order.
    pub destination_bin: String,
}

/// `itemConsolidated` payload from a consolidation station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConsolidatedSignal {
    /// SKU moved.
    pub sku: SkuId,
    /// Source tote.
    pub source_tote_id: String,
    /// Destination bin.
    pub destination_bin: String,
}

/// `consolidationComplete` payload from a consolidation station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationCompleteSignal {
    /// Whether consolidation succeeded.
    pub success: bool,
}

/// `packerAssigned` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackerAssignedSignal {
    /// Packer id.
    pub packer_id: String,
    /// Packing station.
    pub station: String,
}

/// `itemVerified` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemVerifiedSignal {
    /// Verified SKU.
    pub sku: SkuId,
    /// Scan result.
    pub verified: bool,
}

/// `packageSealed` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSealedSignal {
    /// Sealed package id.
    pub package_id: String,
    /// Measured weight in grams.
    pub weight: u32,
}

/// `labelApplied` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelAppliedSignal {
    /// Carrier tracking number.
    pub tracking_number: String,
    /// Carrier code.
    pub carrier: String,
}

/// `packingComplete` payload from a handheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackingCompleteSignal {
    /// Whether packing succeeded.
    pub success: bool,
}

/// `wallingCompleted` payload from the put-wall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WallingCompletedSignal {
    /// Wall task id.
    pub task_id: String,
    /// Route the task served.
    pub route_id: String,
    /// Items sorted into slots.
    pub sorted_items: Vec<SortedItem>,
    /// Whether the sort succeeded.
    pub success: bool,
}

/// `shipConfirmed` payload from SLAM or the carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipConfirmedSignal {
    /// Hand-off instant.
    pub shipped_at: DateTime<Utc>,
    /// Carrier delivery estimate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub estimated_delivery: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_use_camel_case_on_the_wire() {
        let signal = WaveAssignedSignal {
            wave_id: WaveId::from("WV-1"),
            scheduled_start: Utc::now(),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert!(json.get("waveId").is_some());
        assert!(json.get("scheduledStart").is_some());

        let signal = ItemPickedSignal {
            sku: SkuId::from("SKU-A"),
            location_id: LocationId::from("A-01"),
            quantity: 1,
            tote_id: "TOTE-1".to_owned(),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert!(json.get("locationId").is_some());
        assert!(json.get("toteId").is_some());
    }

    #[test]
    fn priority_timeouts_cover_the_matrix() {
        use std::time::Duration;
        assert_eq!(timeouts::WALLING, Duration::from_secs(900));
        assert_eq!(timeouts::PACKER_ASSIGNED, Duration::from_secs(1200));
        assert_eq!(timeouts::PACKING_COMPLETE, Duration::from_secs(3600));
        assert_eq!(timeouts::WORKER_ASSIGNED, Duration::from_secs(1800));
    }
}
