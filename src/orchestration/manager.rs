//! Agent execution manager.
//!
//! The `AgentExecutionManager` admits step executions up to a fixed
//! concurrency bound, runs each one on its own tokio task under a timeout,
//! records every lifecycle transition in the [`ExecutionStore`], and emits
//! [`ExecutionEvent`]s once the store reflects the transition.
//!
//! There is no queueing: a spawn beyond the bound fails immediately with
//! [`Error::CapacityExceeded`] and the caller decides whether to retry.
//! The manager never retries on its own.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use super::handle::{AgentHandle, AgentId, ExecutionControl, ExecutionSlot, SlotGuard, StepFailure};
use crate::agent::{Agent, AgentContext, AgentError, AgentRegistry};
use crate::step::{ExecutionId, StepKind, StepStatus, StepUpdate};
use crate::store::ExecutionStore;
use crate::workflow::WorkflowId;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

/// Tuning knobs for the execution manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of Pending or Running executions.
    pub max_concurrent: usize,
    /// Time an agent may run before the step is failed.
    pub agent_timeout: Duration,
    /// How long settled handles stay inspectable.
    pub handle_retention: Duration,
    /// Sweep period of the background cleanup task.
    pub cleanup_interval: Duration,
    /// Buffer size of the event channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            agent_timeout: Duration::from_secs(300),
            handle_retention: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

/// Lifecycle events, emitted after the store has recorded the transition.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started {
        agent_id: AgentId,
        execution_id: ExecutionId,
        kind: StepKind,
    },
    Completed {
        agent_id: AgentId,
        execution_id: ExecutionId,
        output: serde_json::Value,
    },
    Failed {
        agent_id: AgentId,
        execution_id: ExecutionId,
        error: StepFailure,
    },
}

impl ExecutionEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            ExecutionEvent::Started { agent_id, .. }
            | ExecutionEvent::Completed { agent_id, .. }
            | ExecutionEvent::Failed { agent_id, .. } => *agent_id,
        }
    }
}

/// Point-in-time counts over the handle table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

struct Entry {
    handle: AgentHandle,
    control: Arc<ExecutionControl>,
}

/// Identity of one spawned execution, carried by its body.
#[derive(Clone, Copy)]
struct StepRef {
    agent_id: AgentId,
    workflow_id: WorkflowId,
    execution_id: ExecutionId,
    kind: StepKind,
}

struct Inner {
    store: Arc<dyn ExecutionStore>,
    registry: AgentRegistry,
    config: ManagerConfig,
    running: Arc<AtomicUsize>,
    handles: RwLock<HashMap<AgentId, Entry>>,
    events: broadcast::Sender<ExecutionEvent>,
    shutdown: CancellationToken,
}

/// Bounded-concurrency scheduler for step executions.
///
/// Cheap to clone; clones share the same handle table and bound.
#[derive(Clone)]
pub struct AgentExecutionManager {
    inner: Arc<Inner>,
}

/// Handle to the background cleanup task.
pub struct CleanupTask {
    cancel: CancellationToken,
}

impl CleanupTask {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl AgentExecutionManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: AgentRegistry,
        config: ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        clog_debug!(
            "AgentExecutionManager::new max_concurrent={} timeout={:?} agents={:?}",
            config.max_concurrent,
            config.agent_timeout,
            registry.kinds()
        );
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                running: Arc::new(AtomicUsize::new(0)),
                handles: RwLock::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent
    }

    /// Number of reserved slots (Pending or Running executions).
    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.running_count() < self.max_concurrent()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Spawn a first attempt of a step.
    pub async fn spawn(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
    ) -> Result<AgentId> {
        self.spawn_with_retry(workflow_id, kind, input, 0).await
    }

    /// Spawn a step, recording `retry_count` on its fresh execution row.
    ///
    /// Capacity is reserved before anything is written, so a rejected spawn
    /// leaves no trace in the store. The agent runs on its own task; this
    /// call returns as soon as the Pending row and handle exist.
    pub async fn spawn_with_retry(
        &self,
        workflow_id: WorkflowId,
        kind: StepKind,
        input: serde_json::Value,
        retry_count: u32,
    ) -> Result<AgentId> {
        if self.is_shutdown() {
            return Err(Error::ManagerShutdown);
        }
        let agent = self
            .inner
            .registry
            .get(kind)
            .ok_or(Error::AgentNotRegistered(kind))?;

        let max = self.max_concurrent();
        let guard = match ExecutionSlot::try_acquire(&self.inner.running, max) {
            Some(slot) => SlotGuard::new(slot),
            None => {
                clog_warn!("spawn rejected: {} at capacity ({})", kind, max);
                return Err(Error::CapacityExceeded { max });
            }
        };

        // On error the guard drops here and the slot is given back.
        let execution_id = self
            .inner
            .store
            .create_step_execution(workflow_id, kind, input.clone(), retry_count)
            .await?;

        let agent_id = AgentId::new();
        let control = Arc::new(ExecutionControl::new(
            guard.slot().clone(),
            self.inner.shutdown.child_token(),
        ));
        let handle = AgentHandle::new(agent_id, kind, workflow_id, execution_id, input.clone());
        self.inner.handles.write().await.insert(
            agent_id,
            Entry {
                handle,
                control: Arc::clone(&control),
            },
        );

        clog!(
            "spawned {} agent={} execution={} workflow={} retry={}",
            kind,
            agent_id.short(),
            execution_id.short(),
            workflow_id.short(),
            retry_count
        );

        let inner = Arc::clone(&self.inner);
        let step = StepRef {
            agent_id,
            workflow_id,
            execution_id,
            kind,
        };
        tokio::spawn(async move {
            inner.run(step, agent, input, control, guard).await;
        });

        Ok(agent_id)
    }

    /// Current status of a tracked execution.
    pub async fn status(&self, id: AgentId) -> Result<StepStatus> {
        self.inner
            .handles
            .read()
            .await
            .get(&id)
            .map(|e| e.handle.status)
            .ok_or(Error::HandleNotFound { id })
    }

    /// Snapshot of a tracked handle.
    pub async fn handle(&self, id: AgentId) -> Option<AgentHandle> {
        self.inner
            .handles
            .read()
            .await
            .get(&id)
            .map(|e| e.handle.clone())
    }

    /// Wait for an execution to settle and return its output.
    ///
    /// Resolves immediately for settled handles and re-raises a stored
    /// failure. A `timeout` bounds only this wait; the execution keeps
    /// running when it elapses.
    pub async fn await_completion(
        &self,
        id: AgentId,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        // Subscribe before looking at the handle so a settlement in between
        // is still observed.
        let mut events = self.subscribe();
        if let Some(outcome) = self.settled_outcome(id).await? {
            return outcome.map_err(Error::from);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ExecutionEvent::Completed {
                        agent_id, output, ..
                    }) if agent_id == id => return Ok(output),
                    Ok(ExecutionEvent::Failed {
                        agent_id, error, ..
                    }) if agent_id == id => return Err(Error::from(error)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        clog_debug!("await_completion lagged by {} events", skipped);
                        if let Some(outcome) = self.settled_outcome(id).await? {
                            return outcome.map_err(Error::from);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::ManagerShutdown),
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                Error::AgentTimeout(format!(
                    "timed out after {}ms waiting for agent {}",
                    limit.as_millis(),
                    id.short()
                ))
            })?,
            None => wait.await,
        }
    }

    /// Cancel an execution.
    ///
    /// The step is marked Failed with error "killed", its slot is released,
    /// and its cancellation token fires. The in-flight agent future is
    /// dropped at its next await point; agents holding external resources
    /// see the cancellation through [`AgentContext::cancelled`]. Cancelling
    /// a settled execution is a no-op.
    pub async fn cancel(&self, id: AgentId) -> Result<()> {
        let (control, execution_id) = {
            let handles = self.inner.handles.read().await;
            let entry = handles.get(&id).ok_or(Error::HandleNotFound { id })?;
            (Arc::clone(&entry.control), entry.handle.execution_id)
        };

        if self
            .inner
            .settle(id, &control, execution_id, Err(StepFailure::Killed))
            .await
        {
            clog!("cancelled agent={} execution={}", id.short(), execution_id.short());
        }
        control.cancel.cancel();
        Ok(())
    }

    /// Counts by status over the handle table.
    pub async fn stats(&self) -> ManagerStats {
        let handles = self.inner.handles.read().await;
        let mut stats = ManagerStats {
            total: handles.len(),
            ..Default::default()
        };
        for entry in handles.values() {
            match entry.handle.status {
                StepStatus::Pending => stats.pending += 1,
                StepStatus::Running => stats.running += 1,
                StepStatus::Completed => stats.completed += 1,
                StepStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Evict handles that settled longer ago than the retention period.
    ///
    /// Only the in-memory table is touched.
    pub async fn cleanup(&self) -> usize {
        let retention = self.inner.config.handle_retention;
        let now = Instant::now();
        let mut handles = self.inner.handles.write().await;
        let before = handles.len();
        handles.retain(|_, entry| !entry.handle.is_expired(now, retention));
        let evicted = before - handles.len();
        if evicted > 0 {
            clog_debug!("cleanup evicted {} handles, {} remain", evicted, handles.len());
        }
        evicted
    }

    /// Run [`cleanup`](Self::cleanup) periodically until stopped or shutdown.
    pub fn start_cleanup_task(&self) -> CleanupTask {
        let cancel = self.inner.shutdown.child_token();
        let cancel_clone = cancel.clone();
        let manager = self.clone();
        let period = self.inner.config.cleanup_interval.max(Duration::from_millis(1));

        clog_debug!("cleanup task started period={:?}", period);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        clog_debug!("cleanup task stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        manager.cleanup().await;
                    }
                }
            }
        });

        CleanupTask { cancel }
    }

    /// Cancel every in-flight execution and drop all handles.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut handles = self.inner.handles.write().await;
        clog!("manager shutdown, dropping {} handles", handles.len());
        handles.clear();
    }

    async fn settled_outcome(
        &self,
        id: AgentId,
    ) -> Result<Option<std::result::Result<serde_json::Value, StepFailure>>> {
        let handles = self.inner.handles.read().await;
        let entry = handles.get(&id).ok_or(Error::HandleNotFound { id })?;
        Ok(entry.handle.outcome())
    }
}

impl Inner {
    /// Execution body. The slot guard is held for the whole body so the
    /// slot is released on every exit path.
    async fn run(
        self: Arc<Self>,
        step: StepRef,
        agent: Arc<dyn Agent>,
        input: serde_json::Value,
        control: Arc<ExecutionControl>,
        _guard: SlotGuard,
    ) {
        let StepRef {
            agent_id,
            workflow_id,
            execution_id,
            kind,
        } = step;

        // Cancelled or shut down before the body was scheduled.
        if control.is_settled() || control.cancel.is_cancelled() {
            self.settle(agent_id, &control, execution_id, Err(StepFailure::Killed))
                .await;
            return;
        }

        if let Err(e) = self
            .store
            .update_step_execution(execution_id, StepUpdate::running())
            .await
        {
            // Either cancel got there first or the store is unavailable.
            if !control.is_settled() {
                clog_error!("execution={} could not be marked running: {}", execution_id.short(), e);
                self.settle(
                    agent_id,
                    &control,
                    execution_id,
                    Err(StepFailure::Agent(format!("failed to record running state: {}", e))),
                )
                .await;
            }
            return;
        }
        if control.is_settled() {
            return;
        }

        if let Some(entry) = self.handles.write().await.get_mut(&agent_id) {
            entry.handle.mark_running();
        }
        let _ = self.events.send(ExecutionEvent::Started {
            agent_id,
            execution_id,
            kind,
        });

        let ctx = AgentContext::new(workflow_id, execution_id, kind, control.cancel.clone());
        let limit = self.config.agent_timeout;
        let work = AssertUnwindSafe(agent.execute(input, ctx)).catch_unwind();

        let outcome = tokio::select! {
            _ = control.cancel.cancelled() => Err(StepFailure::Killed),
            result = tokio::time::timeout(limit, work) => match result {
                Err(_) => {
                    clog_warn!("execution={} timed out after {:?}", execution_id.short(), limit);
                    Err(StepFailure::Timeout(format!(
                        "agent timed out after {}ms",
                        limit.as_millis()
                    )))
                }
                Ok(Err(panic)) => Err(StepFailure::Agent(format!(
                    "agent panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Ok(Ok(Err(AgentError::Cancelled))) => Err(StepFailure::Killed),
                Ok(Ok(Err(AgentError::Timeout(d)))) => Err(StepFailure::Timeout(format!(
                    "agent timed out after {}ms",
                    d.as_millis()
                ))),
                Ok(Ok(Err(e))) => Err(StepFailure::Agent(e.to_string())),
                Ok(Ok(Ok(output))) => Ok(output),
            },
        };

        self.settle(agent_id, &control, execution_id, outcome).await;
    }

    /// Write the terminal state exactly once: store, then handle, then
    /// slot release, then event. Returns false if already settled.
    async fn settle(
        &self,
        agent_id: AgentId,
        control: &ExecutionControl,
        execution_id: ExecutionId,
        outcome: std::result::Result<serde_json::Value, StepFailure>,
    ) -> bool {
        if !control.claim() {
            return false;
        }

        let update = match &outcome {
            Ok(output) => StepUpdate::completed(output.clone()),
            Err(failure) => StepUpdate::failed(failure.message()),
        };
        if let Err(e) = self.store.update_step_execution(execution_id, update).await {
            clog_error!("execution={} terminal state not recorded: {}", execution_id.short(), e);
        }

        if let Some(entry) = self.handles.write().await.get_mut(&agent_id) {
            entry.handle.settle(&outcome);
        }
        control.slot.release();

        let event = match outcome {
            Ok(output) => {
                clog!("execution={} completed", execution_id.short());
                ExecutionEvent::Completed {
                    agent_id,
                    execution_id,
                    output,
                }
            }
            Err(error) => {
                clog!("execution={} failed: {}", execution_id.short(), error);
                ExecutionEvent::Failed {
                    agent_id,
                    execution_id,
                    error,
                }
            }
        };
        let _ = self.events.send(event);
        true
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
