//! CloudEvents v1.0 wire envelope with the WMS extension attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wharf_types::CorrelationContext;

use crate::domain_events::DomainEvent;

/// CloudEvents spec version Wharf emits.
pub const SPEC_VERSION: &str = "1.0";

/// Errors converting between domain events and wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Envelope JSON could not be produced or parsed.
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Envelope declared an unsupported spec version.
    #[error("unsupported specversion {0:?}")]
    UnsupportedSpecVersion(String),
}

/// CloudEvents v1.0 JSON envelope.
///
/// The `id` is minted once per logical event, at outbox staging time, and is
/// reused verbatim across relay retries so consumers can deduplicate. The
/// `wms*` extension attributes are flattened at the top level of the JSON
/// object per the CloudEvents extension-attribute convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Always `"1.0"`.
    pub specversion: String,
    /// Stable event id, reused across retries of the same logical event.
    pub id: Uuid,
    /// Producing service as a path segment, e.g. `/order-service`.
    pub source: String,
    /// Reverse-DNS event type, e.g. `com.wms.orders.received`.
    #[serde(rename = "type")]
    pub ty: String,
    /// When the event occurred.
    pub time: DateTime<Utc>,
    /// Always `"application/json"`.
    pub datacontenttype: String,
    /// Aggregate id the event concerns.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    /// Typed payload as a JSON document.
    pub data: serde_json::Value,
    /// End-to-end correlation id. Required extension.
    pub wmscorrelationid: Uuid,
    /// Wave number, when the flow has one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wmswavenumber: Option<String>,
    /// Root workflow instance id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wmsworkflowid: Option<String>,
    /// Facility id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wmsfacilityid: Option<String>,
    /// Warehouse id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wmswarehouseid: Option<String>,
    /// Order id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wmsorderid: Option<String>,
}

impl CloudEvent {
    /// Wrap a domain event for the wire.
    ///
    /// `source` is the producing service name without the leading slash;
    /// correlation extensions are injected from the caller's context.
    pub fn from_domain_event(
        source: &str,
        event: &DomainEvent,
        ctx: &CorrelationContext,
    ) -> Result<Self, EnvelopeError> {
        let data = serde_json::to_value(&event.payload)?;
        Ok(Self {
            specversion: SPEC_VERSION.to_owned(),
            id: Uuid::new_v4(),
            source: format!("/{}", source.trim_start_matches('/')),
            ty: wire_type(event.event_type(), event.payload.domain().category()),
            time: event.occurred_at,
            datacontenttype: "application/json".to_owned(),
            subject: Some(event.aggregate_id.clone()),
            data,
            wmscorrelationid: ctx.correlation_id,
            wmswavenumber: ctx.wave_number.as_ref().map(|w| w.0.clone()),
            wmsworkflowid: ctx.workflow_id.as_ref().map(|w| w.0.clone()),
            wmsfacilityid: ctx.facility_id.as_ref().map(|f| f.0.clone()),
            wmswarehouseid: ctx.warehouse_id.as_ref().map(|w| w.0.clone()),
            wmsorderid: ctx.order_id.as_ref().map(|o| o.0.clone()),
        })
    }

    /// Partition key for the bus: the aggregate id carried in `subject`,
    /// falling back to the envelope id for events without one.
    pub fn partition_key(&self) -> String {
        self.subject
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Recover the typed payload from `data`.
    pub fn payload(&self) -> Result<crate::DomainEventPayload, EnvelopeError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Serialize to the wire bytes stored in outbox rows.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes, rejecting unknown spec versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: CloudEvent = serde_json::from_slice(bytes)?;
        if envelope.specversion != SPEC_VERSION {
            return Err(EnvelopeError::UnsupportedSpecVersion(envelope.specversion));
        }
        Ok(envelope)
    }
}

/// Wire `type` attribute: `com.wms.<category>.<suffix>` where the suffix is
/// the dotted event type minus its leading domain segment.
fn wire_type(event_type: &str, category: &str) -> String {
    let suffix = event_type
        .split_once('.')
        .map(|(_, rest)| rest)
        .unwrap_or(event_type);
    format!("com.wms.{category}.{suffix}")
}
