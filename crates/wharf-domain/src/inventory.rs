//! Per-SKU inventory ledger aggregate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wharf_events::{AggregateType, DomainEvent, DomainEventPayload, InventoryEvent};
use wharf_types::{Clock, LocationId, OrderId, SkuId, WmsError};

use crate::Aggregate;

/// Stock held at one location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationStock {
    /// Units physically present.
    pub quantity: u32,
}

/// An active reservation against the SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Location the units are reserved at.
    pub location_id: LocationId,
    /// Units reserved.
    pub quantity: u32,
}

/// Inventory ledger for a single SKU across locations.
///
/// Invariants: `available = quantity - reserved >= 0`, `reserved <=
/// quantity`, and at most one reservation per order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    sku: SkuId,
    locations: BTreeMap<LocationId, LocationStock>,
    reservations: BTreeMap<OrderId, Reservation>,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl Inventory {
    /// Open an empty ledger for a SKU.
    pub fn new(sku: SkuId) -> Self {
        Self {
            sku,
            locations: BTreeMap::new(),
            reservations: BTreeMap::new(),
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Receive stock into a location.
    pub fn receive(
        &mut self,
        location_id: LocationId,
        quantity: u32,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if quantity == 0 {
            return Err(WmsError::validation("received quantity must be positive"));
        }
        self.locations
            .entry(location_id.clone())
            .or_default()
            .quantity += quantity;
        self.record(
            InventoryEvent::Received {
                location_id,
                quantity,
            },
            clock,
        );
        Ok(())
    }

    /// Reserve units for an order at a location.
    ///
    /// A second reservation for the same order is a no-op when identical and
    /// a conflict otherwise; the single-reservation-per-order invariant is
    /// what keeps activity retries and pick-exception reruns from
    /// double-deducting.
    pub fn reserve(
        &mut self,
        order_id: OrderId,
        location_id: LocationId,
        quantity: u32,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if quantity == 0 {
            return Err(WmsError::validation("reserved quantity must be positive"));
        }
        if let Some(existing) = self.reservations.get(&order_id) {
            if existing.location_id == location_id && existing.quantity == quantity {
                return Ok(());
            }
            return Err(WmsError::conflict(format!(
                "order {order_id} already holds a reservation for sku {}",
                self.sku
            )));
        }
        if self.available_at(&location_id) < quantity as i64 {
            return Err(WmsError::invariant(format!(
                "insufficient stock for sku {} at {location_id}: requested {quantity}, available {}",
                self.sku,
                self.available_at(&location_id)
            )));
        }
        self.reservations.insert(
            order_id.clone(),
            Reservation {
                location_id: location_id.clone(),
                quantity,
            },
        );
        self.record(
            InventoryEvent::Reserved {
                order_id,
                location_id,
                quantity,
            },
            clock,
        );
        Ok(())
    }

    /// Release an order's reservation back to available stock. Releasing a
    /// non-existent reservation is a no-op, which keeps compensation
    /// idempotent.
    pub fn release(&mut self, order_id: &OrderId, clock: &dyn Clock) -> Result<(), WmsError> {
        if let Some(reservation) = self.reservations.remove(order_id) {
            self.record(
                InventoryEvent::Released {
                    order_id: order_id.clone(),
                    quantity: reservation.quantity,
                },
                clock,
            );
        }
        Ok(())
    }

    /// Consume an order's reservation at ship time: stock and reservation
    /// drop together.
    pub fn commit_reservation(
        &mut self,
        order_id: &OrderId,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        let reservation = self
            .reservations
            .get(order_id)
            .cloned()
            .ok_or_else(|| {
                WmsError::not_found(format!(
                    "no reservation for order {order_id} on sku {}",
                    self.sku
                ))
            })?;
        let stock = self
            .locations
            .get_mut(&reservation.location_id)
            .ok_or_else(|| {
                WmsError::internal(format!(
                    "reservation points at unknown location {}",
                    reservation.location_id
                ))
            })?;
        // The reservation was admitted against this stock, so the subtraction
        // cannot underflow unless state was corrupted externally.
        if stock.quantity < reservation.quantity {
            return Err(WmsError::invariant(format!(
                "stock underflow for sku {} at {}",
                self.sku, reservation.location_id
            )));
        }
        stock.quantity -= reservation.quantity;
        self.reservations.remove(order_id);
        self.record(
            InventoryEvent::Committed {
                order_id: order_id.clone(),
                quantity: reservation.quantity,
            },
            clock,
        );
        Ok(())
    }

    /// Cycle-count adjustment. The resulting location quantity must stay
    /// non-negative and cover reservations held against that location.
    pub fn adjust(
        &mut self,
        location_id: LocationId,
        delta: i64,
        reason: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        let current = self
            .locations
            .get(&location_id)
            .map(|s| s.quantity as i64)
            .unwrap_or(0);
        let next = current + delta;
        if next < 0 {
            return Err(WmsError::invariant(format!(
                "adjustment would drive sku {} at {location_id} negative",
                self.sku
            )));
        }
        let reserved_here: i64 = self
            .reservations
            .values()
            .filter(|r| r.location_id == location_id)
            .map(|r| r.quantity as i64)
            .sum();
        if next < reserved_here {
            return Err(WmsError::invariant(format!(
                "adjustment would strand {reserved_here} reserved units of sku {} at {location_id}",
                self.sku
            )));
        }
        self.locations
            .entry(location_id.clone())
            .or_default()
            .quantity = next as u32;
        self.record(
            InventoryEvent::Adjusted {
                location_id,
                delta,
                reason: reason.into(),
            },
            clock,
        );
        Ok(())
    }

    /// First location with at least `quantity` available, for allocation.
    pub fn location_for(&self, quantity: u32) -> Option<&LocationId> {
        self.locations
            .keys()
            .find(|loc| self.available_at(loc) >= quantity as i64)
    }

    /// Find a location other than `exclude` with at least `quantity`
    /// available, for pick-exception rerouting.
    pub fn alternate_location_for(
        &self,
        exclude: &LocationId,
        quantity: u32,
    ) -> Option<&LocationId> {
        self.locations
            .keys()
            .find(|loc| *loc != exclude && self.available_at(loc) >= quantity as i64)
    }

    /// SKU this ledger tracks.
    pub fn sku(&self) -> &SkuId {
        &self.sku
    }

    /// Total units on hand across locations.
    pub fn quantity(&self) -> u32 {
        self.locations.values().map(|s| s.quantity).sum()
    }

    /// Total units reserved.
    pub fn reserved(&self) -> u32 {
        self.reservations.values().map(|r| r.quantity).sum()
    }

    /// Total units available for new reservations.
    pub fn available(&self) -> i64 {
        self.quantity() as i64 - self.reserved() as i64
    }

    /// Reservation held by an order, if any.
    pub fn reservation_for(&self, order_id: &OrderId) -> Option<&Reservation> {
        self.reservations.get(order_id)
    }

    fn available_at(&self, location_id: &LocationId) -> i64 {
        let on_hand = self
            .locations
            .get(location_id)
            .map(|s| s.quantity as i64)
            .unwrap_or(0);
        let reserved: i64 = self
            .reservations
            .values()
            .filter(|r| &r.location_id == location_id)
            .map(|r| r.quantity as i64)
            .sum();
        on_hand - reserved
    }

    fn record(&mut self, event: InventoryEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.sku.0.clone(),
            aggregate_type: AggregateType::Inventory,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Inventory(event),
        });
    }
}

impl Aggregate for Inventory {
    fn aggregate_type() -> AggregateType {
        AggregateType::Inventory
    }

    fn aggregate_id(&self) -> String {
        self.sku.0.clone()
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
