//! Billing invoice aggregate.

use serde::{Deserialize, Serialize};

use wharf_events::{AggregateType, DomainEvent, DomainEventPayload, InvoiceEvent};
use wharf_types::{Clock, CustomerId, InvoiceId, WmsError};

use crate::Aggregate;

/// Invoice lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Accepting line items.
    Draft,
    /// Frozen; awaiting settlement.
    Finalized,
    /// Settled in full.
    Paid,
    /// Payment window elapsed.
    Overdue,
    /// Terminal voided.
    Voided,
}

/// One billed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    /// Description of the charge.
    pub description: String,
    /// Amount in minor currency units.
    pub amount_cents: i64,
}

/// A customer invoice. Finalization freezes line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    customer_id: CustomerId,
    lines: Vec<InvoiceLine>,
    status: InvoiceStatus,
    total_cents: i64,
    version: u64,
    #[serde(skip)]
    pending: Vec<DomainEvent>,
}

impl Invoice {
    /// Open a draft invoice for a customer.
    pub fn draft(id: InvoiceId, customer_id: CustomerId, clock: &dyn Clock) -> Self {
        let mut invoice = Self {
            id,
            customer_id: customer_id.clone(),
            lines: Vec::new(),
            status: InvoiceStatus::Draft,
            total_cents: 0,
            version: 0,
            pending: Vec::new(),
        };
        invoice.record(InvoiceEvent::Drafted { customer_id }, clock);
        invoice
    }

    /// Append a line item. Only drafts accept lines.
    pub fn add_line(
        &mut self,
        description: impl Into<String>,
        amount_cents: i64,
        clock: &dyn Clock,
    ) -> Result<(), WmsError> {
        if self.status != InvoiceStatus::Draft {
            return Err(WmsError::conflict(format!(
                "invoice {} is {:?}; line items are frozen",
                self.id, self.status
            )));
        }
        let description = description.into();
        if description.trim().is_empty() {
            return Err(WmsError::validation("line description cannot be empty"));
        }
        self.lines.push(InvoiceLine {
            description: description.clone(),
            amount_cents,
        });
        self.record(
            InvoiceEvent::LineAdded {
                description,
                amount_cents,
            },
            clock,
        );
        Ok(())
    }

    /// Freeze the draft. Requires at least one line.
    pub fn finalize(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            InvoiceStatus::Draft => {
                if self.lines.is_empty() {
                    return Err(WmsError::validation(format!(
                        "invoice {} has no lines to finalize",
                        self.id
                    )));
                }
                self.status = InvoiceStatus::Finalized;
                self.total_cents = self.lines.iter().map(|l| l.amount_cents).sum();
                self.record(
                    InvoiceEvent::Finalized {
                        total_cents: self.total_cents,
                    },
                    clock,
                );
                Ok(())
            }
            InvoiceStatus::Finalized => Ok(()),
            _ => Err(self.transition_conflict("finalize")),
        }
    }

    /// Record full payment.
    pub fn mark_paid(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            InvoiceStatus::Finalized | InvoiceStatus::Overdue => {
                self.status = InvoiceStatus::Paid;
                self.record(InvoiceEvent::Paid, clock);
                Ok(())
            }
            InvoiceStatus::Paid => Ok(()),
            _ => Err(self.transition_conflict("mark_paid")),
        }
    }

    /// Payment window elapsed without settlement.
    pub fn mark_overdue(&mut self, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            InvoiceStatus::Finalized => {
                self.status = InvoiceStatus::Overdue;
                self.record(InvoiceEvent::Overdue, clock);
                Ok(())
            }
            InvoiceStatus::Overdue => Ok(()),
            _ => Err(self.transition_conflict("mark_overdue")),
        }
    }

    /// Void the invoice. Allowed from every state except paid; voiding twice
    /// is a no-op.
    pub fn void(&mut self, reason: impl Into<String>, clock: &dyn Clock) -> Result<(), WmsError> {
        match self.status {
            InvoiceStatus::Voided => Ok(()),
            InvoiceStatus::Paid => Err(self.transition_conflict("void")),
            _ => {
                self.status = InvoiceStatus::Voided;
                self.record(
                    InvoiceEvent::Voided {
                        reason: reason.into(),
                    },
                    clock,
                );
                Ok(())
            }
        }
    }

    /// Invoice id.
    pub fn id(&self) -> &InvoiceId {
        &self.id
    }

    /// Current status.
    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    /// Billed lines.
    pub fn lines(&self) -> &[InvoiceLine] {
        &self.lines
    }

    /// Total, fixed at finalization.
    pub fn total_cents(&self) -> i64 {
        self.total_cents
    }

    fn record(&mut self, event: InvoiceEvent, clock: &dyn Clock) {
        self.pending.push(DomainEvent {
            aggregate_id: self.id.0.clone(),
            aggregate_type: AggregateType::Invoice,
            occurred_at: clock.now(),
            payload: DomainEventPayload::Invoice(event),
        });
    }

    fn transition_conflict(&self, command: &str) -> WmsError {
        WmsError::conflict(format!(
            "invoice {} cannot {command} in state {:?}",
            self.id, self.status
        ))
    }
}

impl Aggregate for Invoice {
    fn aggregate_type() -> AggregateType {
        AggregateType::Invoice
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

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_types::SystemClock;

    #[test]
    fn finalize_freezes_lines_and_totals() {
        let clock = SystemClock;
        let mut invoice = Invoice::draft(InvoiceId::from("INV-1"), CustomerId::from("CUST-1"), &clock);
        invoice.add_line("storage fee", 1250, &clock).unwrap();
        invoice.add_line("pick fee", 300, &clock).unwrap();
        invoice.finalize(&clock).unwrap();

        assert_eq!(invoice.total_cents(), 1550);
        let err = invoice.add_line("late fee", 100, &clock).unwrap_err();
        assert!(err.message.contains("frozen"));
        assert_eq!(invoice.lines().len(), 2);
    }

    #[test]
    fn empty_draft_cannot_finalize() {
        let clock = SystemClock;
        let mut invoice = Invoice::draft(InvoiceId::from("INV-1"), CustomerId::from("CUST-1"), &clock);
        assert!(invoice.finalize(&clock).is_err());
    }

    #[test]
    fn settlement_paths() {
        let clock = SystemClock;
        let mut invoice = Invoice::draft(InvoiceId::from("INV-1"), CustomerId::from("CUST-1"), &clock);
        invoice.add_line("fee", 100, &clock).unwrap();
        invoice.finalize(&clock).unwrap();
        invoice.mark_overdue(&clock).unwrap();
        invoice.mark_paid(&clock).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        // Paid invoices cannot be voided.
        assert!(invoice.void("mistake", &clock).is_err());
    }

    #[test]
    fn void_from_draft_and_finalized() {
        let clock = SystemClock;
        let mut invoice = Invoice::draft(InvoiceId::from("INV-1"), CustomerId::from("CUST-1"), &clock);
        invoice.void("duplicate", &clock).unwrap();
        invoice.void("duplicate", &clock).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Voided);
        let voided = invoice
            .pending_events()
            .iter()
            .filter(|e| e.event_type() == "invoice.voided")
            .count();
        assert_eq!(voided, 1);
    }
}
