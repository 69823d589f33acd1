//! The engine: one explicit state object owning every registry.
//!
//! All mutable state (tasks, slots, counters, workflows, waiters) lives in
//! [`EngineState`] behind a single mutex. Critical sections never await;
//! side effects that follow a state change (events, persistence, spawning
//! follow-up runs) are collected into [`Effects`] and applied after the
//! lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::config::EngineConfig;
use crate::core::condition;
use crate::core::registry::{TaskRegistry, Transition};
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::executor::{Capabilities, ExecutionContext, Executor, ExecutorRegistry};
use crate::orchestration::advisor;
use crate::orchestration::cron::CronSchedule;
use crate::orchestration::events::{EngineEvent, EventBus};
use crate::orchestration::execution::{ExecuteOptions, ExecutionOutcome, Trigger};
use crate::orchestration::retry::RetryQueue;
use crate::orchestration::scheduler::RecurringScheduler;
use crate::orchestration::slots::SlotPool;
use crate::persistence::{ChangeNotification, PersistenceGateway};
use crate::workflow::{ExecutionId, ExecutionStatus, Workflow, WorkflowExecution, WorkflowId};

/// Aggregate counters, as returned by [`Engine::get_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    /// Failed attempts, retries included.
    pub tasks_failed: u64,
    /// Mean executor wall time of completed attempts, in milliseconds.
    pub average_execution_time: f64,
    pub workflows_executed: u64,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub queued_tasks: usize,
    pub scheduled_tasks: usize,
    pub workflows: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) created: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) execution_ms_total: i64,
    pub(crate) workflows_executed: u64,
}

/// Everything the engine mutates, guarded by one lock.
pub(crate) struct EngineState {
    pub(crate) registry: TaskRegistry,
    pub(crate) slots: SlotPool<ExecuteOptions>,
    pub(crate) counters: Counters,
    pub(crate) workflows: HashMap<WorkflowId, Workflow>,
    pub(crate) executions: HashMap<ExecutionId, WorkflowExecution>,
    /// Callers of `run_to_completion` waiting for a final outcome.
    pub(crate) waiters: HashMap<TaskId, Vec<oneshot::Sender<ExecutionOutcome>>>,
}

impl EngineState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            registry: TaskRegistry::new(),
            slots: SlotPool::new(max_concurrent),
            counters: Counters::default(),
            workflows: HashMap::new(),
            executions: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    pub(crate) fn notify_waiters(&mut self, id: &TaskId, outcome: &ExecutionOutcome) {
        if let Some(waiters) = self.waiters.remove(id) {
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        }
    }
}

/// Side effects produced under the state lock, applied after it is released.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) events: Vec<EngineEvent>,
    /// Tasks to persist, with whether to append a history entry.
    pub(crate) persist: Vec<(Task, bool)>,
    /// Runs to start: (task, options, slot already reserved).
    pub(crate) spawn: Vec<(TaskId, ExecuteOptions, bool)>,
    pub(crate) retry: Option<(TaskId, u32, std::time::Duration, ExecuteOptions)>,
}

impl Effects {
    pub(crate) fn event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub(crate) fn persist(&mut self, task: &Task, history: bool) {
        self.persist.push((task.clone(), history));
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    capabilities: Capabilities,
    gateway: Option<Arc<PersistenceGateway>>,
}

impl EngineBuilder {
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn gateway(mut self, gateway: Arc<PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let events = EventBus::new(self.config.event_capacity);
        Arc::new(Engine {
            state: Mutex::new(EngineState::new(self.config.max_concurrent_tasks)),
            executors: RwLock::new(ExecutorRegistry::new(self.capabilities)),
            scheduler: RecurringScheduler::new(),
            retries: RetryQueue::new(),
            events,
            gateway: self.gateway,
            config: self.config,
        })
    }
}

/// The task/workflow orchestration engine.
///
/// Always handled through an `Arc`: runs spawned by the engine (dependency
/// fan-out, queue draining, retries, recurring triggers) hold a handle to it.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) executors: RwLock<ExecutorRegistry>,
    pub(crate) scheduler: RecurringScheduler,
    pub(crate) retries: RetryQueue,
    pub(crate) events: EventBus,
    pub(crate) gateway: Option<Arc<PersistenceGateway>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            capabilities: Capabilities::default(),
            gateway: None,
        }
    }

    /// Engine with default capabilities and no persistence.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gateway(&self) -> Option<&Arc<PersistenceGateway>> {
        self.gateway.as_ref()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ---- executors ----

    /// Register a custom executor; the last registration for a name wins.
    pub fn register_executor(&self, name: &str, executor: Arc<dyn Executor>) -> bool {
        self.executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(name, executor)
    }

    pub fn register_executor_fn<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register_fn(name, f)
    }

    pub(crate) fn resolve_executor(&self, name: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .resolve(name)
    }

    // ---- tasks ----

    /// Create a task.
    ///
    /// Validates the input, enriches the task with the advisor's score,
    /// estimate and suggestions, stores it, and then either arms its
    /// recurring trigger or (automation enabled, dependencies satisfied)
    /// starts it right away.
    ///
    /// # Errors
    ///
    /// `Validation` (including malformed cron or condition syntax); no task
    /// is created in that case.
    pub fn create_task(self: &Arc<Self>, spec: TaskSpec) -> Result<Task> {
        self.register_task(spec, true)
    }

    pub(crate) fn register_task(self: &Arc<Self>, spec: TaskSpec, auto_start: bool) -> Result<Task> {
        validate_spec(&spec)?;

        let mut task = Task::from_spec(spec);
        let mut effects = Effects::default();
        let start_now = {
            let mut state = self.lock_state();

            let unknown = state.registry.unknown_dependencies(task.dependencies());
            let advice = advisor::advise(&task, state.registry.iter(), Utc::now());
            task.priority_score = advice.priority_score;
            task.estimated_duration_minutes = advice.estimated_duration_minutes;
            task.suggestions = advice.suggestions;
            for dep in &unknown {
                tracing::warn!(task = %task.id.short(), dependency = %dep, "dependency references an unknown task");
                task.suggestions.push(format!(
                    "Dependency {} does not exist yet; this task waits until it is created and completed",
                    dep
                ));
            }

            state.registry.insert(task.clone())?;
            state.counters.created += 1;

            effects.event(EngineEvent::TaskCreated {
                task_id: task.id,
                title: task.title.clone(),
            });
            effects.persist(&task, false);

            auto_start
                && task.automation.enabled
                && task.automation.schedule.is_none()
                && state.registry.unsatisfied_dependencies(&task.id).is_empty()
        };

        tracing::info!(
            task = %task.id.short(),
            title = %task.title,
            score = task.priority_score,
            "task created"
        );
        self.apply(effects);

        if task.automation.enabled {
            if let Some(expression) = task.automation.schedule.clone() {
                self.arm_trigger(task.id, &expression)?;
            }
        }
        if start_now {
            self.spawn_execute(task.id, ExecuteOptions::new(Trigger::Creation), false);
        }
        Ok(task)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.lock_state().registry.get(id).cloned()
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock_state().registry.iter().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Set (or replace) a task's cron expression and arm its trigger.
    ///
    /// # Returns
    ///
    /// `true` when an existing trigger was cancelled and replaced.
    pub fn schedule_task(self: &Arc<Self>, id: &TaskId, expression: &str) -> Result<bool> {
        CronSchedule::parse(expression)?;
        let task = {
            let mut state = self.lock_state();
            state.registry.annotate(id, |task| {
                task.automation.schedule = Some(expression.to_string());
                task.updated_at = Utc::now();
            })?;
            state.registry.get(id).cloned()
        };
        if let Some(task) = &task {
            self.persist(task, false);
        }
        self.arm_trigger(*id, expression)
    }

    /// Remove a task's recurring trigger.
    pub fn unschedule_task(&self, id: &TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn is_scheduled(&self, id: &TaskId) -> bool {
        self.scheduler.is_scheduled(id)
    }

    fn arm_trigger(self: &Arc<Self>, id: TaskId, expression: &str) -> Result<bool> {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(id, expression, move |id| {
            if let Some(engine) = weak.upgrade() {
                engine.spawn_execute(id, ExecuteOptions::new(Trigger::Schedule), false);
            }
            std::future::ready(())
        })
    }

    /// Drop a task from memory, cancelling its trigger and pending retry.
    ///
    /// The durable record (if any) is left alone; callers of
    /// `run_to_completion` waiting on the task get `TaskNotFound`.
    pub fn evict_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.cancel(id);
        self.retries.cancel(id);
        let task = {
            let mut state = self.lock_state();
            let task = state
                .registry
                .evict(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            state.slots.remove_queued(id);
            state.waiters.remove(id);
            task
        };
        tracing::info!(task = %id.short(), "task evicted");
        self.events.publish(EngineEvent::TaskEvicted { task_id: *id });
        Ok(task)
    }

    /// Evict a task only if it is still completed with a completion time
    /// before `cutoff`. The check and the removal share one lock, so a task
    /// rearmed or rerun in between stays.
    pub(crate) fn evict_expired(&self, id: &TaskId, cutoff: DateTime<Utc>) -> Option<Task> {
        let task = {
            let mut state = self.lock_state();
            let expired = state.registry.get(id).is_some_and(|t| {
                t.status == TaskStatus::Completed && t.completed_at.is_some_and(|at| at < cutoff)
            });
            if !expired {
                return None;
            }
            let task = state.registry.evict(id)?;
            state.slots.remove_queued(id);
            state.waiters.remove(id);
            task
        };
        self.scheduler.cancel(id);
        self.retries.cancel(id);
        tracing::info!(task = %id.short(), "expired task evicted");
        self.events.publish(EngineEvent::TaskEvicted { task_id: *id });
        Some(task)
    }

    // ---- metrics ----

    pub fn get_metrics(&self) -> Metrics {
        let state = self.lock_state();
        let counters = &state.counters;
        let average = if counters.completed > 0 {
            counters.execution_ms_total as f64 / counters.completed as f64
        } else {
            0.0
        };
        Metrics {
            tasks_created: counters.created,
            tasks_completed: counters.completed,
            tasks_failed: counters.failed,
            average_execution_time: average,
            workflows_executed: counters.workflows_executed,
            active_tasks: state.registry.count_by_status(TaskStatus::InProgress),
            pending_tasks: state.registry.count_by_status(TaskStatus::Pending),
            queued_tasks: state.slots.queued_count(),
            scheduled_tasks: self.scheduler.len(),
            workflows: state.workflows.len(),
        }
    }

    /// Executions currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.lock_state().slots.active_count()
    }

    /// Highest number of simultaneously held slots so far.
    pub fn peak_in_flight(&self) -> usize {
        self.lock_state().slots.peak()
    }

    // ---- persistence ----

    pub(crate) fn persist(&self, task: &Task, history: bool) {
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save_task(task, history) {
                tracing::warn!(task = %task.id.short(), error = %e, "failed to persist task");
            }
        }
    }

    pub(crate) fn apply(self: &Arc<Self>, effects: Effects) {
        for (task, history) in &effects.persist {
            self.persist(task, *history);
        }
        for event in effects.events {
            self.events.publish(event);
        }
        if let Some((id, attempt, delay, options)) = effects.retry {
            self.schedule_retry(id, attempt, delay, options);
        }
        for (id, options, reserved) in effects.spawn {
            self.spawn_execute(id, options, reserved);
        }
    }

    /// Load every persisted task into memory and re-arm recurring triggers.
    ///
    /// Tasks persisted as in progress were interrupted by a restart and are
    /// marked failed.
    pub fn load_persisted(self: &Arc<Self>) -> Result<usize> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(0);
        };
        let records = gateway.load_tasks()?;
        let workflows = gateway.load_workflows()?;
        let executions = gateway.load_executions()?;
        let mut loaded = 0;
        let mut schedules = Vec::new();
        let mut interrupted = Vec::new();
        let mut abandoned = Vec::new();
        {
            let mut state = self.lock_state();
            for workflow in workflows {
                state.workflows.insert(workflow.id, workflow);
            }
            for mut execution in executions {
                if !execution.is_finished() {
                    execution.finish(ExecutionStatus::Failed, Some("interrupted by restart".to_string()));
                    abandoned.push(execution.clone());
                }
                state.executions.insert(execution.id, execution);
            }
            for record in records {
                let mut task = record.task;
                if task.status == TaskStatus::InProgress {
                    task.fail("interrupted by restart")?;
                    interrupted.push(task.clone());
                }
                if let (true, Some(expr)) = (task.automation.enabled, &task.automation.schedule) {
                    schedules.push((task.id, expr.clone()));
                }
                match state.registry.upsert(task) {
                    Ok(()) => loaded += 1,
                    Err(e) => tracing::warn!(error = %e, "skipping persisted task"),
                }
            }
        }
        for task in &interrupted {
            self.persist(task, true);
        }
        for execution in &abandoned {
            if let Err(e) = gateway.save_execution(execution) {
                tracing::warn!(execution = %execution.id.short(), error = %e, "failed to persist execution");
            }
        }
        for (id, expression) in schedules {
            if let Err(e) = self.arm_trigger(id, &expression) {
                tracing::warn!(task = %id.short(), error = %e, "could not re-arm trigger");
            }
        }
        tracing::info!(loaded, interrupted = interrupted.len(), "persisted tasks loaded");
        Ok(loaded)
    }

    /// Apply one external change notification to the in-memory registry.
    ///
    /// Updates older than the in-memory record are ignored. Records that
    /// would close a dependency cycle are rejected. While a task is running
    /// or holds a slot, only its descriptive fields are taken from the
    /// change so the run can still record its outcome.
    pub fn apply_change(self: &Arc<Self>, change: ChangeNotification) -> Result<()> {
        match change {
            ChangeNotification::Insert(task) | ChangeNotification::Update(task) => {
                let id = task.id;
                let schedule = task
                    .automation
                    .schedule
                    .clone()
                    .filter(|_| task.automation.enabled);
                {
                    let mut state = self.lock_state();
                    let mut record = task;
                    if let Some(current) = state.registry.get(&id) {
                        if current.updated_at > record.updated_at {
                            tracing::debug!(task = %id.short(), "ignoring stale change notification");
                            return Ok(());
                        }
                        let in_flight = current.status == TaskStatus::InProgress
                            || state.slots.is_active(&id)
                            || state.slots.position(&id).is_some();
                        if in_flight {
                            tracing::debug!(task = %id.short(), "task in flight, keeping run state");
                            let mut merged = current.clone();
                            merged.merge_details(record);
                            record = merged;
                        }
                    }
                    state.registry.upsert(record)?;
                }
                match schedule {
                    Some(expression) => {
                        if self.scheduler.expression(&id).as_deref() != Some(expression.as_str()) {
                            self.arm_trigger(id, &expression)?;
                        }
                    }
                    None => {
                        self.scheduler.cancel(&id);
                    }
                }
                tracing::debug!(task = %id.short(), "change notification applied");
                Ok(())
            }
            ChangeNotification::Delete(id) => match self.evict_task(&id) {
                Ok(_) | Err(Error::TaskNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Stop every trigger and pending retry.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        self.retries.cancel_all();
        tracing::info!("engine stopped");
    }

    // ---- internals shared with execution/workflow ----

    pub(crate) fn transition(
        state: &mut EngineState,
        effects: &mut Effects,
        id: &TaskId,
        transition: Transition,
    ) -> Result<Task> {
        let history = matches!(transition, Transition::Complete(_) | Transition::Fail(_));
        let task = state.registry.transition(id, transition)?.clone();
        effects.persist(&task, history);
        Ok(task)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.retries.cancel_all();
    }
}

fn validate_spec(spec: &TaskSpec) -> Result<()> {
    spec.validate()?;
    if let Some(expression) = &spec.automation.schedule {
        CronSchedule::parse(expression)
            .map_err(|e| Error::Validation(format!("automation.schedule: {}", e)))?;
    }
    condition::validate_all(&spec.automation.conditions)
        .map_err(|e| Error::Validation(format!("automation.conditions: {}", e)))
}
