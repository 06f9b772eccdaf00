//! The engine: instance lifecycle, registries, signal routing, compensation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wharf_resilience::{retry, RetryPolicy};
use wharf_types::Clock;

use crate::context::{CompensationStack, ParentClosePolicy, WorkflowCtx};
use crate::history::{HistoryEvent, WorkflowHistoryStore, WorkflowStatus};
use crate::{WorkflowError, WorkflowResult};

//─────────────────────────────
//  Workflow and activity contracts
//─────────────────────────────

/// A deterministic, durable workflow function.
///
/// Implementations must confine suspension and nondeterminism to the
/// [`WorkflowCtx`] facilities; everything else must be a pure function of
/// the input and the command outcomes.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Registered name, referenced by `start` and child invocations.
    fn name(&self) -> &str;

    /// The workflow body.
    async fn run(&self, ctx: WorkflowCtx, input: Value) -> WorkflowResult;
}

/// A side-effecting operation invoked from workflows.
///
/// Activities are where all I/O happens; the engine records their outcomes
/// and retries them per policy, so implementations must be idempotent under
/// replays of commands that already committed.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Registered name.
    fn name(&self) -> &str;

    /// Execute one attempt.
    async fn execute(&self, input: Value) -> anyhow::Result<Value>;
}

type ActivityFn =
    Box<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct FnActivity {
    name: String,
    f: ActivityFn,
}

#[async_trait]
impl Activity for FnActivity {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        (self.f)(input).await
    }
}

/// Name-indexed activity registrations.
#[derive(Default)]
pub struct ActivityRegistry {
    map: DashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation under its name.
    pub fn register(&self, activity: Arc<dyn Activity>) {
        self.map.insert(activity.name().to_owned(), activity);
    }

    /// Register a closure as an activity.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(Arc::new(FnActivity {
            name: name.to_owned(),
            f: Box::new(move |input| Box::pin(f(input))),
        }));
    }

    /// Look up an activity by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.map.get(name).map(|a| Arc::clone(&a))
    }
}

//─────────────────────────────
//  Signal hub
//─────────────────────────────

struct HubInner {
    channels: HashMap<String, VecDeque<Value>>,
    seen_deliveries: HashSet<String>,
}

/// Per-instance signal channels with buffering and delivery dedup.
pub(crate) struct SignalHub {
    inner: StdMutex<HubInner>,
    notify: Notify,
}

impl SignalHub {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(HubInner {
                channels: HashMap::new(),
                seen_deliveries: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Buffer a signal. Returns false when the delivery id was already
    /// seen (the engine deduplicates at-least-once deliveries).
    fn deliver(&self, channel: &str, payload: Value, delivery_id: &str) -> bool {
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !inner.seen_deliveries.insert(delivery_id.to_owned()) {
                return false;
            }
            inner
                .channels
                .entry(channel.to_owned())
                .or_default()
                .push_back(payload);
        }
        self.notify.notify_waiters();
        true
    }

    fn try_pop(&self, channel: &str) -> Option<Value> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.channels.get_mut(channel).and_then(VecDeque::pop_front)
    }

    fn try_pop_any(&self, channels: &[&str]) -> Option<(String, Value)> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for channel in channels {
            if let Some(payload) = inner
                .channels
                .get_mut(*channel)
                .and_then(VecDeque::pop_front)
            {
                return Some(((*channel).to_owned(), payload));
            }
        }
        None
    }

    /// Wait for the next buffered signal on `channel`.
    pub(crate) async fn recv(&self, channel: &str) -> Value {
        loop {
            // Register for wakeups before checking the buffer so a delivery
            // between the pop attempt and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(payload) = self.try_pop(channel) {
                return payload;
            }
            notified.await;
        }
    }

    /// Wait for the next buffered signal on any of `channels`, earliest
    /// listed channel first when several have buffered payloads.
    pub(crate) async fn recv_any(&self, channels: &[&str]) -> (String, Value) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(hit) = self.try_pop_any(channels) {
                return hit;
            }
            notified.await;
        }
    }
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Engine tuning knobs.
#[derive(Clone)]
pub struct WorkflowEngineConfig {
    /// Retry policy applied to compensation activities during unwind.
    pub compensation_retry: RetryPolicy,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            compensation_retry: RetryPolicy::aggressive(),
        }
    }
}

struct Instance {
    status_tx: watch::Sender<WorkflowStatus>,
    status_rx: watch::Receiver<WorkflowStatus>,
    cancel: CancellationToken,
    cancel_reason: StdMutex<Option<String>>,
    children: StdMutex<Vec<(String, ParentClosePolicy)>>,
}

/// Durable workflow engine: registries plus the live instance table.
pub struct WorkflowEngine {
    workflows: DashMap<String, Arc<dyn Workflow>>,
    activities: Arc<ActivityRegistry>,
    history: Arc<dyn WorkflowHistoryStore>,
    clock: Arc<dyn Clock>,
    instances: DashMap<String, Arc<Instance>>,
    hubs: DashMap<String, Arc<SignalHub>>,
    config: WorkflowEngineConfig,
}

impl WorkflowEngine {
    /// Create an engine over a history store.
    pub fn new(
        history: Arc<dyn WorkflowHistoryStore>,
        clock: Arc<dyn Clock>,
        config: WorkflowEngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            workflows: DashMap::new(),
            activities: Arc::new(ActivityRegistry::new()),
            history,
            clock,
            instances: DashMap::new(),
            hubs: DashMap::new(),
            config,
        })
    }

    /// Register a workflow implementation.
    pub fn register_workflow(&self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.name().to_owned(), workflow);
    }

    /// Register an activity implementation.
    pub fn register_activity(&self, activity: Arc<dyn Activity>) {
        self.activities.register(activity);
    }

    /// Register a closure as an activity.
    pub fn register_activity_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.activities.register_fn(name, f);
    }

    /// Start (or re-attach to) a workflow instance.
    ///
    /// Starting an id that already has history resumes it from that history
    /// instead of running side effects again, which makes `start` safe to
    /// retry.
    pub async fn start(
        self: &Arc<Self>,
        workflow_id: &str,
        workflow_name: &str,
        input: Value,
    ) -> Result<(), WorkflowError> {
        if self.instances.contains_key(workflow_id) {
            debug!(workflow = workflow_id, "instance already attached");
            return Ok(());
        }

        let mut history = self
            .history
            .load(workflow_id)
            .await
            .map_err(WorkflowError::internal)?;

        let (name, input) = match history.first() {
            Some(HistoryEvent::Started { workflow, input }) => {
                (workflow.clone(), input.clone())
            }
            Some(other) => {
                return Err(WorkflowError::Internal(format!(
                    "history for {workflow_id} starts with {} instead of started",
                    other.kind()
                )))
            }
            None => {
                let started = HistoryEvent::Started {
                    workflow: workflow_name.to_owned(),
                    input: input.clone(),
                };
                self.history
                    .append(workflow_id, started.clone())
                    .await
                    .map_err(WorkflowError::internal)?;
                history.push(started);
                (workflow_name.to_owned(), input)
            }
        };

        let workflow = self
            .workflows
            .get(&name)
            .map(|w| Arc::clone(&w))
            .ok_or_else(|| {
                WorkflowError::Internal(format!("workflow {name:?} is not registered"))
            })?;

        let (status_tx, status_rx) = watch::channel(WorkflowStatus::Running);
        let instance = Arc::new(Instance {
            status_tx,
            status_rx,
            cancel: CancellationToken::new(),
            cancel_reason: StdMutex::new(None),
            children: StdMutex::new(Vec::new()),
        });
        self.instances
            .insert(workflow_id.to_owned(), Arc::clone(&instance));

        let ctx = WorkflowCtx {
            engine: Arc::clone(self),
            workflow_id: workflow_id.to_owned(),
            history,
            cursor: 1, // skip the Started event
            signals: self.hub(workflow_id),
            cancel: instance.cancel.clone(),
            compensations: Arc::new(StdMutex::new(Vec::new())),
        };
        let compensations = Arc::clone(&ctx.compensations);
        let engine = Arc::clone(self);
        let id = workflow_id.to_owned();

        tokio::spawn(async move {
            info!(workflow = %id, name = %name, "workflow started");
            // A panicking workflow body must still park the instance as
            // failed instead of leaving waiters hanging.
            let result = std::panic::AssertUnwindSafe(workflow.run(ctx, input))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(workflow = %id, "workflow body panicked");
                    Err(WorkflowError::Internal("workflow panicked".to_owned()))
                });
            engine.finish_instance(&id, &instance, compensations, result).await;
        });
        Ok(())
    }

    /// Re-enter an instance from its stored history after a restart.
    pub async fn resume(self: &Arc<Self>, workflow_id: &str) -> Result<(), WorkflowError> {
        let history = self
            .history
            .load(workflow_id)
            .await
            .map_err(WorkflowError::internal)?;
        match history.first() {
            Some(HistoryEvent::Started { .. }) => {
                self.start(workflow_id, "", Value::Null).await
            }
            _ => Err(WorkflowError::Internal(format!(
                "no history to resume for {workflow_id}"
            ))),
        }
    }

    /// Deliver a signal. At-least-once friendly: redeliveries with the same
    /// `delivery_id` are dropped; signals sent before the workflow awaits
    /// are buffered.
    pub async fn signal(
        &self,
        workflow_id: &str,
        channel: &str,
        payload: Value,
        delivery_id: &str,
    ) -> Result<(), WorkflowError> {
        let fresh = self.hub(workflow_id).deliver(channel, payload, delivery_id);
        if !fresh {
            debug!(workflow = workflow_id, channel, delivery_id, "duplicate signal dropped");
        }
        Ok(())
    }

    /// Cancel an instance. Propagates to `Terminate`-policy children, runs
    /// the compensation stack, then parks the instance as `Cancelled`.
    pub async fn cancel(&self, workflow_id: &str, reason: &str) {
        if let Some(instance) = self.instances.get(workflow_id) {
            if instance.status_rx.borrow().is_terminal() {
                return;
            }
            info!(workflow = workflow_id, reason, "cancelling workflow");
            if let Ok(mut slot) = instance.cancel_reason.lock() {
                *slot = Some(reason.to_owned());
            }
            instance.cancel.cancel();
        }
    }

    /// Current status, if the instance is attached to this engine.
    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.instances
            .get(workflow_id)
            .map(|i| i.status_rx.borrow().clone())
    }

    /// Wait for an instance to reach a terminal status.
    pub async fn await_instance(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let mut rx = self
            .instances
            .get(workflow_id)
            .map(|i| i.status_rx.clone())
            .ok_or_else(|| {
                WorkflowError::Internal(format!("unknown workflow instance {workflow_id}"))
            })?;
        loop {
            let status = rx.borrow().clone();
            if status.is_terminal() {
                return Ok(status);
            }
            rx.changed().await.map_err(WorkflowError::internal)?;
        }
    }

    //───────────────────── internals ─────────────────────

    pub(crate) fn activity(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name)
    }

    pub(crate) fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn append_history(
        &self,
        workflow_id: &str,
        event: HistoryEvent,
    ) -> anyhow::Result<()> {
        self.history.append(workflow_id, event).await
    }

    pub(crate) fn cancel_reason(&self, workflow_id: &str) -> String {
        self.instances
            .get(workflow_id)
            .and_then(|i| i.cancel_reason.lock().ok().and_then(|r| r.clone()))
            .unwrap_or_else(|| "cancelled".to_owned())
    }

    pub(crate) async fn start_child(
        self: &Arc<Self>,
        parent_id: &str,
        child_id: &str,
        workflow: &str,
        input: Value,
        policy: ParentClosePolicy,
    ) -> Result<(), WorkflowError> {
        self.start(child_id, workflow, input).await?;
        if let Some(parent) = self.instances.get(parent_id) {
            if let Ok(mut children) = parent.children.lock() {
                children.push((child_id.to_owned(), policy));
            }
        }
        Ok(())
    }

    fn hub(&self, workflow_id: &str) -> Arc<SignalHub> {
        self.hubs
            .entry(workflow_id.to_owned())
            .or_insert_with(|| Arc::new(SignalHub::new()))
            .clone()
    }

    async fn finish_instance(
        self: &Arc<Self>,
        workflow_id: &str,
        instance: &Arc<Instance>,
        compensations: CompensationStack,
        result: WorkflowResult,
    ) {
        let status = match result {
            Ok(value) => {
                info!(workflow = workflow_id, "workflow completed");
                WorkflowStatus::Completed { result: value }
            }
            Err(WorkflowError::Cancelled { reason }) => {
                info!(workflow = workflow_id, reason = %reason, "workflow cancelled, compensating");
                self.unwind(workflow_id, &compensations).await;
                WorkflowStatus::Cancelled { reason }
            }
            Err(err) => {
                warn!(workflow = workflow_id, error = %err, "workflow failed, compensating");
                self.unwind(workflow_id, &compensations).await;
                WorkflowStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };

        self.close_children(workflow_id, instance).await;
        let _ = instance.status_tx.send(status);
    }

    /// Unwind the compensation stack LIFO. Compensation failures are logged
    /// and swallowed; they never trigger further compensation.
    async fn unwind(&self, workflow_id: &str, compensations: &CompensationStack) {
        let stack: Vec<(String, Value)> = match compensations.lock() {
            Ok(mut stack) => stack.drain(..).collect(),
            Err(_) => {
                error!(workflow = workflow_id, "compensation stack poisoned");
                return;
            }
        };
        for (name, input) in stack.into_iter().rev() {
            let Some(activity) = self.activities.get(&name) else {
                error!(workflow = workflow_id, activity = %name, "compensation activity missing");
                continue;
            };
            let outcome = retry(&self.config.compensation_retry, || {
                let activity = Arc::clone(&activity);
                let input = input.clone();
                async move { activity.execute(input).await }
            })
            .await;
            match outcome {
                Ok(_) => debug!(workflow = workflow_id, activity = %name, "compensation applied"),
                Err(err) => {
                    error!(workflow = workflow_id, activity = %name, error = %err, "compensation failed")
                }
            }
        }
    }

    async fn close_children(&self, workflow_id: &str, instance: &Arc<Instance>) {
        let children: Vec<(String, ParentClosePolicy)> = match instance.children.lock() {
            Ok(children) => children.clone(),
            Err(_) => return,
        };
        for (child_id, policy) in children {
            match policy {
                ParentClosePolicy::Abandon => {}
                ParentClosePolicy::Terminate => {
                    let still_running = self
                        .status(&child_id)
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false);
                    if still_running {
                        debug!(workflow = workflow_id, child = %child_id, "terminating child");
                        self.cancel(&child_id, "parent closed").await;
                    }
                }
            }
        }
    }
}
