#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wharf-workflow** – Durable workflow engine for Wharf.
//!
//! Workflows are deterministic functions that suspend only at engine
//! facilities: activity calls, timers, signal awaits (or a select over a
//! signal and a timer), and child workflows. Every suspension outcome is
//! recorded to an append-only per-instance history; re-running the function
//! over its history replays recorded outcomes without re-executing side
//! effects, which is what lets a workflow survive a worker crash and resume
//! on another process.
//!
//! Wall-clock reads and randomness go through engine markers
//! ([`WorkflowCtx::now`], [`WorkflowCtx::new_uuid`]) so replay stays
//! deterministic. Compensation activities pushed during execution unwind in
//! LIFO order when the workflow fails or is cancelled.

mod context;
mod engine;
mod history;

pub use context::{
    ActivityOptions, ChildOptions, ParentClosePolicy, SignalOrTimeout, WorkflowCtx,
};
pub use engine::{
    Activity, ActivityRegistry, Workflow, WorkflowEngine, WorkflowEngineConfig,
};
pub use history::{
    HistoryEvent, InMemoryHistoryStore, WorkflowHistoryStore, WorkflowStatus,
};

use serde_json::Value;

/// Failures surfaced to workflow code and to callers awaiting a workflow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    /// An activity exhausted its retry policy or hit a non-retryable error.
    #[error("activity {name} failed: {reason}")]
    ActivityFailed {
        /// Activity name.
        name: String,
        /// Final error rendering.
        reason: String,
    },
    /// A child workflow terminated unsuccessfully.
    #[error("child workflow {child_id} failed: {reason}")]
    ChildFailed {
        /// Child instance id.
        child_id: String,
        /// Child failure reason.
        reason: String,
    },
    /// A stage gave up waiting; carried as the saga's failure reason.
    #[error("workflow timed out: {0}")]
    Timeout(String),
    /// The workflow decided to fail itself with a business reason.
    #[error("workflow aborted: {reason}")]
    Aborted {
        /// Business failure reason.
        reason: String,
    },
    /// The instance was cancelled from outside.
    #[error("workflow cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
    /// Replay diverged from recorded history.
    #[error("non-deterministic replay: {0}")]
    NonDeterminism(String),
    /// Engine-level failure (unknown workflow, serialization, store).
    #[error("workflow engine error: {0}")]
    Internal(String),
}

impl WorkflowError {
    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        WorkflowError::Internal(err.to_string())
    }
}

/// Convenience alias for workflow function results.
pub type WorkflowResult = Result<Value, WorkflowError>;
