//! Per-instance history: the durable record replay runs against.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One recorded suspension outcome.
///
/// Replay consumes these in order; each command issued by workflow code must
/// match the next recorded event or the replay is non-deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Instance created. Always the first event; carries what `resume`
    /// needs to re-enter the function.
    Started {
        /// Registered workflow name.
        workflow: String,
        /// Input value.
        input: Value,
    },
    /// Activity returned successfully.
    ActivityCompleted {
        /// Activity name.
        name: String,
        /// Result value.
        result: Value,
    },
    /// Activity exhausted retries or failed non-retryably.
    ActivityFailed {
        /// Activity name.
        name: String,
        /// Final error rendering.
        error: String,
    },
    /// A timer elapsed.
    TimerFired {
        /// Requested duration in milliseconds.
        duration_ms: u64,
    },
    /// A signal await was satisfied.
    SignalReceived {
        /// Channel name.
        channel: String,
        /// Signal payload.
        payload: Value,
    },
    /// A signal-or-timer select resolved to the signal arm.
    SelectSignal {
        /// Channel name.
        channel: String,
        /// Signal payload.
        payload: Value,
    },
    /// A signal-or-timer select resolved to the timer arm.
    SelectTimeout {
        /// Channel name the select was waiting on.
        channel: String,
        /// Timeout that fired, in milliseconds.
        timeout_ms: u64,
    },
    /// A child workflow completed.
    ChildCompleted {
        /// Child instance id.
        child_id: String,
        /// Child result value.
        result: Value,
    },
    /// A child workflow failed, was cancelled, or timed out.
    ChildFailed {
        /// Child instance id.
        child_id: String,
        /// Failure rendering.
        error: String,
    },
    /// Deterministic wall-clock marker.
    TimeMarker {
        /// Recorded instant.
        at: DateTime<Utc>,
    },
    /// Deterministic randomness marker.
    UuidMarker {
        /// Recorded id.
        id: Uuid,
    },
}

impl HistoryEvent {
    /// Short tag for divergence diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEvent::Started { .. } => "started",
            HistoryEvent::ActivityCompleted { .. } => "activity_completed",
            HistoryEvent::ActivityFailed { .. } => "activity_failed",
            HistoryEvent::TimerFired { .. } => "timer_fired",
            HistoryEvent::SignalReceived { .. } => "signal_received",
            HistoryEvent::SelectSignal { .. } => "select_signal",
            HistoryEvent::SelectTimeout { .. } => "select_timeout",
            HistoryEvent::ChildCompleted { .. } => "child_completed",
            HistoryEvent::ChildFailed { .. } => "child_failed",
            HistoryEvent::TimeMarker { .. } => "time_marker",
            HistoryEvent::UuidMarker { .. } => "uuid_marker",
        }
    }
}

/// Terminal and in-flight instance states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Function executing or suspended.
    Running,
    /// Terminal success.
    Completed {
        /// Workflow return value.
        result: Value,
    },
    /// Terminal failure, after compensation ran.
    Failed {
        /// Typed failure rendering.
        reason: String,
    },
    /// Terminal cancellation, after compensation ran.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl WorkflowStatus {
    /// Whether the instance reached a sink state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// Append-only history persistence.
#[async_trait]
pub trait WorkflowHistoryStore: Send + Sync {
    /// Append one event to an instance's history.
    async fn append(&self, workflow_id: &str, event: HistoryEvent) -> Result<()>;

    /// Load the full history of an instance (empty if unknown).
    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>>;

    /// Ids of every instance with recorded history.
    async fn known_ids(&self) -> Result<Vec<String>>;
}

/// Non-persistent history store for tests and single-process runs.
#[derive(Default, Clone)]
pub struct InMemoryHistoryStore {
    inner: Arc<RwLock<HashMap<String, Vec<HistoryEvent>>>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowHistoryStore for InMemoryHistoryStore {
    async fn append(&self, workflow_id: &str, event: HistoryEvent) -> Result<()> {
        self.inner
            .write()
            .await
            .entry(workflow_id.to_owned())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn known_ids(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_load_preserve_order() {
        let store = InMemoryHistoryStore::new();
        store
            .append(
                "wf-1",
                HistoryEvent::Started {
                    workflow: "demo".to_owned(),
                    input: Value::Null,
                },
            )
            .await
            .unwrap();
        store
            .append(
                "wf-1",
                HistoryEvent::TimerFired { duration_ms: 1000 },
            )
            .await
            .unwrap();

        let history = store.load("wf-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind(), "started");
        assert_eq!(history[1].kind(), "timer_fired");
        assert!(store.load("unknown").await.unwrap().is_empty());
        assert_eq!(store.known_ids().await.unwrap(), vec!["wf-1".to_owned()]);
    }

    #[test]
    fn history_round_trips_through_json() {
        let event = HistoryEvent::SelectSignal {
            channel: "waveAssigned".to_owned(),
            payload: serde_json::json!({"waveId": "WV-1"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
