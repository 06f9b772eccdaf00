//! The shipped read models: inventory-by-SKU and orders-by-customer.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use wharf_bus_core::PublishedRecord;
use wharf_events::{DomainEventPayload, InventoryEvent, OrderEvent, Topic};

use crate::Projection;

//─────────────────────────────
//  Inventory by SKU
//─────────────────────────────

/// Denormalized stock totals for one SKU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InventoryView {
    /// Units physically present across locations.
    pub on_hand: i64,
    /// Units reserved for orders.
    pub reserved: i64,
}

impl InventoryView {
    /// Units available for new reservations.
    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }
}

/// Per-SKU stock listing fed from the inventory topic.
#[derive(Default)]
pub struct InventoryBySkuProjection {
    views: DashMap<String, InventoryView>,
}

impl InventoryBySkuProjection {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for one SKU.
    pub fn get(&self, sku: &str) -> Option<InventoryView> {
        self.views.get(sku).map(|v| *v)
    }

    /// Full listing, sorted by SKU.
    pub fn list(&self) -> Vec<(String, InventoryView)> {
        let mut rows: Vec<(String, InventoryView)> = self
            .views
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[async_trait]
impl Projection for InventoryBySkuProjection {
    fn name(&self) -> &str {
        "inventory-by-sku"
    }

    fn topics(&self) -> Vec<String> {
        vec![Topic::Inventory.as_str().to_owned()]
    }

    async fn apply(&self, record: &PublishedRecord) -> Result<()> {
        let DomainEventPayload::Inventory(event) = record.envelope.payload()? else {
            // Foreign event on the topic; ignore rather than poison the view.
            debug!(ty = %record.envelope.ty, "skipping non-inventory event");
            return Ok(());
        };
        let sku = record.envelope.partition_key();
        let mut view = self.views.entry(sku).or_default();
        match event {
            InventoryEvent::Received { quantity, .. } => view.on_hand += quantity as i64,
            InventoryEvent::Reserved { quantity, .. } => view.reserved += quantity as i64,
            InventoryEvent::Released { quantity, .. } => view.reserved -= quantity as i64,
            InventoryEvent::Committed { quantity, .. } => {
                view.on_hand -= quantity as i64;
                view.reserved -= quantity as i64;
            }
            InventoryEvent::Adjusted { delta, .. } => view.on_hand += delta,
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.views.clear();
        Ok(())
    }
}

//─────────────────────────────
//  Orders by customer
//─────────────────────────────

/// One order as a customer sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    /// Order id.
    pub order_id: String,
    /// Latest lifecycle status string (`received`, `picking`, …).
    pub status: String,
    /// Total items on the order.
    pub item_count: u32,
    /// Last event applied.
    pub updated_at: DateTime<Utc>,
}

/// Customer-keyed order listing fed from the orders topic.
#[derive(Default)]
pub struct OrdersByCustomerProjection {
    orders: DashMap<String, OrderSummary>,
    by_customer: DashMap<String, Vec<String>>,
}

impl OrdersByCustomerProjection {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders for one customer, most recently updated first.
    pub fn for_customer(&self, customer_id: &str) -> Vec<OrderSummary> {
        let ids = self
            .by_customer
            .get(customer_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut summaries: Vec<OrderSummary> = ids
            .iter()
            .filter_map(|id| self.orders.get(id).map(|s| s.clone()))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// One order's summary.
    pub fn order(&self, order_id: &str) -> Option<OrderSummary> {
        self.orders.get(order_id).map(|s| s.clone())
    }

    fn status_for(event: &OrderEvent) -> &'static str {
        match event {
            OrderEvent::Received { .. } => "received",
            OrderEvent::Validated => "validated",
            OrderEvent::AssignedToWave { .. } => "wave_assigned",
            OrderEvent::PickingStarted => "picking",
            OrderEvent::ConsolidationStarted => "consolidating",
            OrderEvent::PackingStarted => "packing",
            OrderEvent::Shipped { .. } => "shipped",
            OrderEvent::Completed => "completed",
            OrderEvent::Cancelled { .. } => "cancelled",
        }
    }
}

#[async_trait]
impl Projection for OrdersByCustomerProjection {
    fn name(&self) -> &str {
        "orders-by-customer"
    }

    fn topics(&self) -> Vec<String> {
        vec![Topic::Orders.as_str().to_owned()]
    }

    async fn apply(&self, record: &PublishedRecord) -> Result<()> {
        let DomainEventPayload::Order(event) = record.envelope.payload()? else {
            debug!(ty = %record.envelope.ty, "skipping non-order event");
            return Ok(());
        };
        let order_id = record.envelope.partition_key();
        let updated_at = record.envelope.time;

        match &event {
            OrderEvent::Received {
                customer_id, lines, ..
            } => {
                let item_count = lines.iter().map(|l| l.quantity).sum();
                self.orders.insert(
                    order_id.clone(),
                    OrderSummary {
                        order_id: order_id.clone(),
                        status: "received".to_owned(),
                        item_count,
                        updated_at,
                    },
                );
                let mut ids = self.by_customer.entry(customer_id.0.clone()).or_default();
                if !ids.contains(&order_id) {
                    ids.push(order_id);
                }
            }
            other => {
                if let Some(mut summary) = self.orders.get_mut(&order_id) {
                    summary.status = Self::status_for(other).to_owned();
                    summary.updated_at = updated_at;
                }
            }
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.orders.clear();
        self.by_customer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_events::{AggregateType, CloudEvent, DomainEvent, OrderLine};
    use wharf_types::{CorrelationContext, CustomerId, Priority};

    fn order_record(order_id: &str, offset: u64, event: OrderEvent) -> PublishedRecord {
        let domain_event = DomainEvent {
            aggregate_id: order_id.to_owned(),
            aggregate_type: AggregateType::Order,
            occurred_at: Utc::now(),
            payload: DomainEventPayload::Order(event),
        };
        let envelope =
            CloudEvent::from_domain_event("order-service", &domain_event, &CorrelationContext::new())
                .unwrap();
        PublishedRecord {
            offset,
            key: order_id.to_owned(),
            envelope,
        }
    }

    #[tokio::test]
    async fn order_lifecycle_folds_into_summary() {
        let view = OrdersByCustomerProjection::new();
        view.apply(&order_record(
            "ORD-1",
            0,
            OrderEvent::Received {
                customer_id: CustomerId::from("CUST-1"),
                priority: Priority::Standard,
                lines: vec![OrderLine {
                    sku: "SKU-A".into(),
                    quantity: 2,
                    zone: None,
                }],
                multi_zone: false,
            },
        ))
        .await
        .unwrap();
        view.apply(&order_record("ORD-1", 1, OrderEvent::Validated))
            .await
            .unwrap();

        let orders = view.for_customer("CUST-1");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "validated");
        assert_eq!(orders[0].item_count, 2);
        assert!(view.for_customer("CUST-2").is_empty());
    }

    #[tokio::test]
    async fn status_update_for_unknown_order_is_ignored() {
        let view = OrdersByCustomerProjection::new();
        // Out-of-order delivery from before the view's rebuild horizon.
        view.apply(&order_record("ORD-9", 0, OrderEvent::Completed))
            .await
            .unwrap();
        assert!(view.order("ORD-9").is_none());
    }
}
