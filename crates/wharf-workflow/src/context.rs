//! The workflow-side handle: every legal suspension point lives here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use wharf_resilience::{retry, RetryPolicy};

use crate::engine::{SignalHub, WorkflowEngine};
use crate::history::{HistoryEvent, WorkflowStatus};
use crate::WorkflowError;

/// Per-invocation activity execution options.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Retry policy applied around attempts.
    pub retry: RetryPolicy,
    /// Per-attempt deadline.
    pub start_to_close: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::standard(),
            start_to_close: Duration::from_secs(30),
        }
    }
}

/// What happens to a running child when its parent reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentClosePolicy {
    /// Cancel the child with the parent. The default.
    Terminate,
    /// Leave the child running, fire-and-forget.
    Abandon,
}

/// Child workflow start options.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Overall deadline for the child; expiry cancels it and fails the
    /// await.
    pub execution_timeout: Option<Duration>,
    /// Parent-close behavior.
    pub parent_close_policy: ParentClosePolicy,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            execution_timeout: None,
            parent_close_policy: ParentClosePolicy::Terminate,
        }
    }
}

/// Outcome of a select over a signal channel and a timer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOrTimeout<T> {
    /// The signal arrived first.
    Signal(T),
    /// The timer fired first; the signal await was cancelled.
    Timeout,
}

pub(crate) type CompensationStack = Arc<Mutex<Vec<(String, Value)>>>;

/// Handle given to a workflow function.
///
/// All methods take `&mut self`: workflow code is cooperative
/// single-threaded, one command at a time, which is what makes the recorded
/// history a total order.
pub struct WorkflowCtx {
    pub(crate) engine: Arc<WorkflowEngine>,
    pub(crate) workflow_id: String,
    pub(crate) history: Vec<HistoryEvent>,
    pub(crate) cursor: usize,
    pub(crate) signals: Arc<SignalHub>,
    pub(crate) cancel: CancellationToken,
    pub(crate) compensations: CompensationStack,
}

impl WorkflowCtx {
    /// This instance's id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Execute an activity with default options.
    pub async fn activity<I, O>(&mut self, name: &str, input: &I) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.activity_with(name, input, ActivityOptions::default())
            .await
    }

    /// Execute an activity under an explicit retry policy and deadline.
    ///
    /// The outcome (success or final failure) is recorded; on replay the
    /// recorded outcome is returned without re-executing the activity.
    pub async fn activity_with<I, O>(
        &mut self,
        name: &str,
        input: &I,
        options: ActivityOptions,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::ActivityCompleted { name: recorded, result }
                    if recorded == name =>
                {
                    self.cursor += 1;
                    from_value(result)
                }
                HistoryEvent::ActivityFailed { name: recorded, error } if recorded == name => {
                    self.cursor += 1;
                    Err(WorkflowError::ActivityFailed {
                        name: name.to_owned(),
                        reason: error,
                    })
                }
                other => Err(self.divergence("activity", name, &other)),
            };
        }

        let input = to_value(input)?;
        let activity = self.engine.activity(name).ok_or_else(|| {
            WorkflowError::Internal(format!("activity {name:?} is not registered"))
        })?;

        let attempt_name = name.to_owned();
        let run = retry(&options.retry, || {
            let activity = Arc::clone(&activity);
            let input = input.clone();
            let attempt_name = attempt_name.clone();
            async move {
                // A panicking activity marks this attempt failed; the retry
                // policy decides what happens next.
                let attempt = std::panic::AssertUnwindSafe(activity.execute(input))
                    .catch_unwind()
                    .map(|outcome| match outcome {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("activity {attempt_name} panicked")),
                    });
                tokio::time::timeout(options.start_to_close, attempt)
                    .await
                    .map_err(|_| anyhow::anyhow!("activity timed out"))?
            }
        });

        let result = tokio::select! {
            result = run => result,
            _ = self.cancel.cancelled() => {
                return Err(self.cancelled_error());
            }
        };

        match result {
            Ok(value) => {
                self.record(HistoryEvent::ActivityCompleted {
                    name: name.to_owned(),
                    result: value.clone(),
                })
                .await?;
                from_value(value)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.record(HistoryEvent::ActivityFailed {
                    name: name.to_owned(),
                    error: reason.clone(),
                })
                .await?;
                Err(WorkflowError::ActivityFailed {
                    name: name.to_owned(),
                    reason,
                })
            }
        }
    }

    /// Durable timer.
    pub async fn timer(&mut self, duration: Duration) -> Result<(), WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::TimerFired { .. } => {
                    self.cursor += 1;
                    Ok(())
                }
                other => Err(self.divergence("timer", "", &other)),
            };
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
        }
        self.record(HistoryEvent::TimerFired {
            duration_ms: duration.as_millis() as u64,
        })
        .await
    }

    /// Await the next signal on `channel`. Signals sent before this await
    /// are buffered and consumed in arrival order.
    pub async fn signal<O: DeserializeOwned>(
        &mut self,
        channel: &str,
    ) -> Result<O, WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::SignalReceived { channel: recorded, payload }
                    if recorded == channel =>
                {
                    self.cursor += 1;
                    from_value(payload)
                }
                other => Err(self.divergence("signal", channel, &other)),
            };
        }
        let payload = tokio::select! {
            payload = self.signals.recv(channel) => payload,
            _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
        };
        self.record(HistoryEvent::SignalReceived {
            channel: channel.to_owned(),
            payload: payload.clone(),
        })
        .await?;
        from_value(payload)
    }

    /// Select over a signal channel and a timer; whichever fires first wins
    /// and the other arm is dropped.
    pub async fn signal_or_timer<O: DeserializeOwned>(
        &mut self,
        channel: &str,
        timeout: Duration,
    ) -> Result<SignalOrTimeout<O>, WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::SelectSignal { channel: recorded, payload }
                    if recorded == channel =>
                {
                    self.cursor += 1;
                    Ok(SignalOrTimeout::Signal(from_value(payload)?))
                }
                HistoryEvent::SelectTimeout { channel: recorded, .. } if recorded == channel => {
                    self.cursor += 1;
                    Ok(SignalOrTimeout::Timeout)
                }
                other => Err(self.divergence("signal_or_timer", channel, &other)),
            };
        }

        let outcome = tokio::select! {
            payload = self.signals.recv(channel) => Some(payload),
            _ = tokio::time::sleep(timeout) => None,
            _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
        };
        match outcome {
            Some(payload) => {
                self.record(HistoryEvent::SelectSignal {
                    channel: channel.to_owned(),
                    payload: payload.clone(),
                })
                .await?;
                Ok(SignalOrTimeout::Signal(from_value(payload)?))
            }
            None => {
                debug!(
                    workflow = %self.workflow_id,
                    channel,
                    timeout_ms = timeout.as_millis() as u64,
                    "select resolved to timeout"
                );
                self.record(HistoryEvent::SelectTimeout {
                    channel: channel.to_owned(),
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await?;
                Ok(SignalOrTimeout::Timeout)
            }
        }
    }

    /// Select over several signal channels and a timer. Returns the channel
    /// that fired together with its raw payload, or `Timeout`.
    pub async fn signals_or_timer(
        &mut self,
        channels: &[&str],
        timeout: Duration,
    ) -> Result<SignalOrTimeout<(String, Value)>, WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::SelectSignal { channel: recorded, payload }
                    if channels.contains(&recorded.as_str()) =>
                {
                    self.cursor += 1;
                    Ok(SignalOrTimeout::Signal((recorded, payload)))
                }
                HistoryEvent::SelectTimeout { channel: recorded, .. }
                    if channels.contains(&recorded.as_str())
                        || recorded == channels.join("|") =>
                {
                    self.cursor += 1;
                    Ok(SignalOrTimeout::Timeout)
                }
                other => Err(self.divergence("signals_or_timer", &channels.join("|"), &other)),
            };
        }

        let outcome = tokio::select! {
            hit = self.signals.recv_any(channels) => Some(hit),
            _ = tokio::time::sleep(timeout) => None,
            _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
        };
        match outcome {
            Some((channel, payload)) => {
                self.record(HistoryEvent::SelectSignal {
                    channel: channel.clone(),
                    payload: payload.clone(),
                })
                .await?;
                Ok(SignalOrTimeout::Signal((channel, payload)))
            }
            None => {
                self.record(HistoryEvent::SelectTimeout {
                    channel: channels.join("|"),
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await?;
                Ok(SignalOrTimeout::Timeout)
            }
        }
    }

    /// Run a child workflow to completion with default options.
    pub async fn child<I, O>(
        &mut self,
        workflow: &str,
        child_id: &str,
        input: &I,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.child_with(workflow, child_id, input, ChildOptions::default())
            .await
    }

    /// Run a child workflow with explicit options. The child's terminal
    /// outcome is recorded in the parent history; on replay the child is not
    /// re-run.
    pub async fn child_with<I, O>(
        &mut self,
        workflow: &str,
        child_id: &str,
        input: &I,
        options: ChildOptions,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::ChildCompleted { child_id: recorded, result }
                    if recorded == child_id =>
                {
                    self.cursor += 1;
                    from_value(result)
                }
                HistoryEvent::ChildFailed { child_id: recorded, error } if recorded == child_id => {
                    self.cursor += 1;
                    Err(WorkflowError::ChildFailed {
                        child_id: child_id.to_owned(),
                        reason: error,
                    })
                }
                other => Err(self.divergence("child", child_id, &other)),
            };
        }

        let input = to_value(input)?;
        self.engine
            .start_child(
                &self.workflow_id,
                child_id,
                workflow,
                input,
                options.parent_close_policy,
            )
            .await?;

        let status = match options.execution_timeout {
            None => tokio::select! {
                status = self.engine.await_instance(child_id) => status?,
                _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
            },
            Some(deadline) => {
                let outcome = tokio::select! {
                    status = self.engine.await_instance(child_id) => Some(status?),
                    _ = tokio::time::sleep(deadline) => None,
                    _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
                };
                match outcome {
                    Some(status) => status,
                    None => {
                        self.engine
                            .cancel(child_id, "execution timeout exceeded")
                            .await;
                        let reason = format!("execution timeout after {deadline:?}");
                        self.record(HistoryEvent::ChildFailed {
                            child_id: child_id.to_owned(),
                            error: reason.clone(),
                        })
                        .await?;
                        return Err(WorkflowError::ChildFailed {
                            child_id: child_id.to_owned(),
                            reason,
                        });
                    }
                }
            }
        };

        match status {
            WorkflowStatus::Completed { result } => {
                self.record(HistoryEvent::ChildCompleted {
                    child_id: child_id.to_owned(),
                    result: result.clone(),
                })
                .await?;
                from_value(result)
            }
            WorkflowStatus::Failed { reason } | WorkflowStatus::Cancelled { reason } => {
                self.record(HistoryEvent::ChildFailed {
                    child_id: child_id.to_owned(),
                    error: reason.clone(),
                })
                .await?;
                Err(WorkflowError::ChildFailed {
                    child_id: child_id.to_owned(),
                    reason,
                })
            }
            WorkflowStatus::Running => Err(WorkflowError::Internal(
                "await_instance returned a non-terminal status".to_owned(),
            )),
        }
    }

    /// Push a compensation activity to unwind if this workflow fails or is
    /// cancelled. Compensations run LIFO under the aggressive retry policy
    /// and never trigger further compensation.
    pub fn push_compensation<I: Serialize>(
        &mut self,
        activity: &str,
        input: &I,
    ) -> Result<(), WorkflowError> {
        let input = to_value(input)?;
        self.compensations
            .lock()
            .map_err(WorkflowError::internal)?
            .push((activity.to_owned(), input));
        Ok(())
    }

    /// Deterministic wall-clock read.
    pub async fn now(&mut self) -> Result<DateTime<Utc>, WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::TimeMarker { at } => {
                    self.cursor += 1;
                    Ok(at)
                }
                other => Err(self.divergence("now", "", &other)),
            };
        }
        let at = self.engine.clock_now();
        self.record(HistoryEvent::TimeMarker { at }).await?;
        Ok(at)
    }

    /// Deterministic random id.
    pub async fn new_uuid(&mut self) -> Result<Uuid, WorkflowError> {
        if let Some(event) = self.peeked() {
            return match event {
                HistoryEvent::UuidMarker { id } => {
                    self.cursor += 1;
                    Ok(id)
                }
                other => Err(self.divergence("new_uuid", "", &other)),
            };
        }
        let id = Uuid::new_v4();
        self.record(HistoryEvent::UuidMarker { id }).await?;
        Ok(id)
    }

    //───────────────────── internals ─────────────────────

    fn peeked(&self) -> Option<HistoryEvent> {
        self.history.get(self.cursor).cloned()
    }

    async fn record(&mut self, event: HistoryEvent) -> Result<(), WorkflowError> {
        self.engine
            .append_history(&self.workflow_id, event.clone())
            .await
            .map_err(WorkflowError::internal)?;
        self.history.push(event);
        self.cursor += 1;
        Ok(())
    }

    fn divergence(&self, command: &str, detail: &str, recorded: &HistoryEvent) -> WorkflowError {
        WorkflowError::NonDeterminism(format!(
            "workflow {} issued {command}({detail}) at step {} but history recorded {}",
            self.workflow_id,
            self.cursor,
            recorded.kind()
        ))
    }

    fn cancelled_error(&self) -> WorkflowError {
        WorkflowError::Cancelled {
            reason: self.engine.cancel_reason(&self.workflow_id),
        }
    }
}

fn to_value<I: Serialize>(input: &I) -> Result<Value, WorkflowError> {
    serde_json::to_value(input).map_err(WorkflowError::internal)
}

fn from_value<O: DeserializeOwned>(value: Value) -> Result<O, WorkflowError> {
    serde_json::from_value(value).map_err(WorkflowError::internal)
}
