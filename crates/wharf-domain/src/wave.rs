//! Picking wave aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wharf_events::{AggregateType, DomainEvent, DomainEventPayload, WaveEvent};
use wharf_types::{Clock, OrderId, WaveId, WmsError};

use crate::Aggregate;

/// Wave lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    /// Accepting orders.
    Planning,
    /// Frozen with a start time.
    Scheduled,
    /// Released to the floor.
    Released,
    /// Work underway.
    InProgress,
    /// All orders finished.
    Completed,
    /// Abandoned.
    Cancelled,
}

impl WaveStatus {
    /// Whether this is a sink state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WaveStatus::Completed | WaveStatus::Cancelled)
    }
}

/// Membership entry for one order in the wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WaveOrder {
    order_id: OrderId,
    item_count: u32,
}

/// A batch of orders planned and released together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    id: WaveId,
    max_orders: u32,
    max_items: u32,
    orders: Vec<WaveOrder>,
    status: WaveStatus,
    scheduled_start: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl Wave {
    /// Open a new wave for planning with the given capacity limits.
    pub fn plan(
        id: WaveId,
        max_orders: u32,
        max_items: u32,
        clock: &dyn Clock,
    ) -> Result<Self, WmsError> {
        if max_orders == 0 || max_items == 0 {
            return Err(WmsError::validation("wave capacity must be positive"));
        }
        let mut wave = Self {
            id,
            max_orders,
            max_items,
            orders: Vec::new(),
            status: WaveStatus::Planning,
            scheduled_start: None,
            cancel_reason: None,
            version: 0,
            pending: Vec::new(),
        };
        wave.record(
            WaveEvent::Planned {
                max_orders,
                max_items,
            },
            clock,
        );
        Ok(wave)
    }

    /// Add an order during planning. Enforces the order-count and item-count
    /// capacity invariants; re-adding the same order is a no-op.
    pub fn add_order(
        &mut self,
        order_id: OrderId,
        item_count: u32,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if self.status != WaveStatus::Planning {
            return Err(self.transition_conflict("add_order"));
        }
        if self.orders.iter().any(|o| o.order_id == order_id) {
            return Ok(());
        }
        if self.orders.len() as u32 >= self.max_orders {
            return Err(WmsError::invariant(format!(
                "wave {} at order capacity {}",
                self.id, self.max_orders
            )));
        }
        if self.item_count() + item_count > self.max_items {
            return Err(WmsError::invariant(format!(
                "wave {} would exceed item capacity {}",
                self.id, self.max_items
            )));
        }
        self.orders.push(WaveOrder {
            order_id: order_id.clone(),
            item_count,
        });
        self.record(
            WaveEvent::OrderAdded {
                order_id,
                item_count,
            },
            clock,
        );
        Ok(())
    }

    /// Remove an order before release. Removing an absent order is a no-op.
    pub fn remove_order(&mut self, order_id: &OrderId, clock: &dyn Clock) -> Result<(), WmsError> {
        if matches!(self.status, WaveStatus::Released | WaveStatus::InProgress)
            || self.status.is_terminal()
        {
            return Err(self.transition_conflict("remove_order"));
        }
        let before = self.orders.len();
        self.orders.retain(|o| &o.order_id != order_id);
        if self.orders.len() < before {
            self.record(
                WaveEvent::OrderRemoved {
                    order_id: order_id.clone(),
                },
                clock,
            );
        }
        Ok(())
    }

    /// Freeze planning with a scheduled start. Requires at least one order.
    pub fn schedule(
        &mut self,
        scheduled_start: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        match self.status {
            WaveStatus::Planning => {
                if self.orders.is_empty() {
                    return Err(WmsError::validation(format!(
                        "wave {} has no orders to schedule",
                        self.id
                    )));
                }
                self.status = WaveStatus::Scheduled;
                self.scheduled_start = Some(scheduled_start);
                self.record(WaveEvent::Scheduled { scheduled_start }, clock);
                Ok(())
            }
            WaveStatus::Scheduled => Ok(()),
            _ => Err(self.transition_conflict("schedule")),
        }
    }

    /// Release the wave to the floor.
    pub fn release(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            WaveStatus::Scheduled => {
                self.status = WaveStatus::Released;
                self.record(WaveEvent::Released, clock);
                Ok(())
            }
            WaveStatus::Released => Ok(()),
            _ => Err(self.transition_conflict("release")),
        }
    }

    /// First task started.
    pub fn start(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            WaveStatus::Released => {
                self.status = WaveStatus::InProgress;
                self.record(WaveEvent::InProgress, clock);
                Ok(())
            }
            WaveStatus::InProgress => Ok(()),
            _ => Err(self.transition_conflict("start")),
        }
    }

    /// All orders in the wave finished.
    pub fn complete(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            WaveStatus::InProgress => {
                self.status = WaveStatus::Completed;
                self.record(WaveEvent::Completed, clock);
                Ok(())
            }
            WaveStatus::Completed => Ok(()),
            _ => Err(self.transition_conflict("complete")),
        }
    }

    /// Abandon the wave from any non-terminal state.
    pub fn cancel(&mut self, reason: impl Into<String>, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            WaveStatus::Cancelled => Ok(()),
            s if s.is_terminal() => Err(self.transition_conflict("cancel")),
            _ => {
                let reason = reason.into();
                self.status = WaveStatus::Cancelled;
                self.cancel_reason = Some(reason.clone());
                self.record(WaveEvent::Cancelled { reason }, clock);
                Ok(())
            }
        }
    }

    /// Wave id.
    pub fn id(&self) -> &WaveId {
        &self.id
    }

    /// Current status.
    pub fn status(&self) -> WaveStatus {
        self.status
    }

    /// Orders currently planned into the wave.
    pub fn order_ids(&self) -> Vec<&OrderId> {
        self.orders.iter().map(|o| &o.order_id).collect()
    }

    /// Total items across member orders.
    pub fn item_count(&self) -> u32 {
        self.orders.iter().map(|o| o.item_count).sum()
    }

    /// Scheduled start, once set.
    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start
    }

    fn record(&mut self, event: WaveEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.id.0.clone(),
            aggregate_type: AggregateType::Wave,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Wave(event),
        });
    }

    fn transition_conflict(&self, command: &str) -> WmsError {
        WmsError::conflict(format!(
            "wave {} cannot {command} in state {:?}",
            self.id, self.status
        ))
    }
}

impl Aggregate for Wave {
    fn aggregate_type() -> AggregateType {
        AggregateType::Wave
    }

    fn aggregate_id(&self) -> String {
        self.id.0.clone()
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
