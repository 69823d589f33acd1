//! The single execution path.
//!
//! Manual calls, creation-time starts, dependency fan-out, recurring
//! triggers, retries and workflow steps all enter through
//! [`Engine::execute_task`]. In order, a run:
//!
//! 1. checks the task's lifecycle state (completed tasks only re-run on a
//!    recurring trigger, failed ones only on retry or `force`),
//! 2. checks dependencies (`waiting`) and conditions (`skipped`),
//! 3. resolves the executor (a missing executor fails without retry),
//! 4. takes a concurrency slot or joins the FIFO queue (`queued`),
//! 5. runs the executor under a deadline and records the result,
//! 6. releases the slot to the next queued task, schedules a retry on
//!    failure, and fans out to dependents on success.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

use crate::core::condition;
use crate::core::registry::Transition;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, Executor};
use crate::orchestration::engine::{Effects, Engine, EngineState};
use crate::orchestration::events::EngineEvent;
use crate::orchestration::retry;

/// What caused an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Creation,
    Dependency,
    Schedule,
    Retry,
    Workflow,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trigger::Manual => "manual",
            Trigger::Creation => "creation",
            Trigger::Dependency => "dependency",
            Trigger::Schedule => "schedule",
            Trigger::Retry => "retry",
            Trigger::Workflow => "workflow",
        };
        f.write_str(name)
    }
}

/// Options for one execution request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecuteOptions {
    pub trigger: Trigger,
    /// Executor deadline; the configured default when unset.
    pub timeout: Option<Duration>,
    /// Made available to conditions and to the executor.
    pub context: Value,
    /// Reset a permanently failed task and run it again.
    pub force: bool,
}

impl ExecuteOptions {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }

    pub fn manual() -> Self {
        Self::new(Trigger::Manual)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result of an execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        result: Value,
    },
    Failed {
        error: String,
        will_retry: bool,
    },
    /// Dependencies are not all completed; no slot was taken.
    Waiting {
        reason: String,
        pending: Vec<TaskId>,
    },
    /// No slot was free; the task runs when one is released.
    Queued {
        position: usize,
    },
    /// A condition did not hold; nothing ran.
    Skipped {
        condition: String,
    },
    /// Already executing.
    Running,
}

impl ExecutionOutcome {
    /// Whether nothing further will happen for this request without a new
    /// trigger.
    pub fn is_final(&self) -> bool {
        match self {
            ExecutionOutcome::Completed { .. }
            | ExecutionOutcome::Waiting { .. }
            | ExecutionOutcome::Skipped { .. } => true,
            ExecutionOutcome::Failed { will_retry, .. } => !will_retry,
            ExecutionOutcome::Queued { .. } | ExecutionOutcome::Running => false,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::Failed { .. } => "failed",
            ExecutionOutcome::Waiting { .. } => "waiting",
            ExecutionOutcome::Queued { .. } => "queued",
            ExecutionOutcome::Skipped { .. } => "skipped",
            ExecutionOutcome::Running => "running",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }
}

/// A run that has its slot and is in progress.
struct Plan {
    executor: Arc<dyn Executor>,
    ctx: ExecutionContext,
    timeout: Duration,
    options: ExecuteOptions,
}

enum Admission {
    Run(Plan),
    Done(ExecutionOutcome),
}

impl Engine {
    /// Execute a task through the standard path.
    ///
    /// Non-error outcomes (`waiting`, `queued`, `skipped`, `running`) are
    /// values. Executor failures are reported as `failed` outcomes, not
    /// errors.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for an unknown id.
    pub async fn execute_task(self: &Arc<Self>, id: TaskId, options: ExecuteOptions) -> Result<ExecutionOutcome> {
        self.execute_inner(id, options, false).await
    }

    /// Execute and wait for the task's final outcome, following it through
    /// queueing and retries.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        id: TaskId,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if !state.registry.contains(&id) {
                return Err(Error::TaskNotFound(id.to_string()));
            }
            let waiters = state.waiters.entry(id).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
        }

        let outcome = self.execute_task(id, options).await?;
        if outcome.is_final() {
            return Ok(outcome);
        }
        rx.await.map_err(|_| Error::TaskNotFound(id.to_string()))
    }

    /// Start a run on its own tokio task.
    ///
    /// Kept as a plain function so the spawned future's type does not
    /// depend on the caller's.
    pub(crate) fn spawn_execute(self: &Arc<Self>, id: TaskId, options: ExecuteOptions, reserved: bool) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute_inner(id, options, reserved).await {
                tracing::warn!(task = %id.short(), error = %e, "background execution failed");
            }
        });
    }

    pub(crate) fn schedule_retry(
        self: &Arc<Self>,
        id: TaskId,
        attempt: u32,
        delay: Duration,
        options: ExecuteOptions,
    ) {
        let weak = Arc::downgrade(self);
        self.retries.schedule(id, attempt, delay, move |id| {
            if let Some(engine) = weak.upgrade() {
                let options = ExecuteOptions {
                    trigger: Trigger::Retry,
                    force: false,
                    ..options
                };
                engine.spawn_execute(id, options, false);
            }
            std::future::ready(())
        });
    }

    async fn execute_inner(
        self: &Arc<Self>,
        id: TaskId,
        options: ExecuteOptions,
        reserved: bool,
    ) -> Result<ExecutionOutcome> {
        let mut effects = Effects::default();
        let admission = {
            let mut state = self.lock_state();
            let admission = self.admit(&mut state, &mut effects, id, &options, reserved);
            let ran = matches!(admission, Ok(Admission::Run(_)));
            if reserved && !ran {
                // The slot handed over from the queue is not needed
                if let Some((next, next_options)) = state.slots.release(&id) {
                    effects.spawn.push((next, next_options, true));
                }
            }
            if let Ok(Admission::Done(outcome)) = &admission {
                if outcome.is_final() {
                    state.notify_waiters(&id, outcome);
                }
            }
            admission
        };
        self.apply(effects);

        let plan = match admission? {
            Admission::Done(outcome) => {
                tracing::debug!(task = %id.short(), trigger = %options.trigger, outcome = outcome.status(), "not executed");
                return Ok(outcome);
            }
            Admission::Run(plan) => plan,
        };

        let attempt = plan.ctx.attempt;
        let timeout = plan.timeout;
        let options = plan.options.clone();
        let result = run_with_deadline(plan).await;

        let mut effects = Effects::default();
        let outcome = {
            let mut state = self.lock_state();
            let outcome = self.record(&mut state, &mut effects, id, attempt, result, options);
            if let Some((next, next_options)) = state.slots.release(&id) {
                tracing::debug!(task = %next.short(), "slot handed to queued task");
                effects.spawn.push((next, next_options, true));
            }
            if let Some(outcome) = &outcome {
                if outcome.is_final() {
                    state.notify_waiters(&id, outcome);
                }
            }
            outcome
        };
        self.apply(effects);

        match outcome {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::debug!(task = %id.short(), ?timeout, "task evicted while running");
                Err(Error::TaskNotFound(id.to_string()))
            }
        }
    }

    /// Decide whether a run may start; on success the task is in progress
    /// and holds a slot.
    fn admit(
        &self,
        state: &mut EngineState,
        effects: &mut Effects,
        id: TaskId,
        options: &ExecuteOptions,
        reserved: bool,
    ) -> Result<Admission> {
        let task = state
            .registry
            .get(&id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        if !reserved {
            if state.slots.is_active(&id) {
                return Ok(Admission::Done(ExecutionOutcome::Running));
            }
            if let Some(position) = state.slots.position(&id) {
                return Ok(Admission::Done(ExecutionOutcome::Queued { position }));
            }
        }

        let status = task.status;
        let stored_result = task.result.clone();
        let last_error = task.last_error.clone();
        match status {
            TaskStatus::InProgress => return Ok(Admission::Done(ExecutionOutcome::Running)),
            TaskStatus::Completed if options.trigger != Trigger::Schedule => {
                return Ok(Admission::Done(ExecutionOutcome::Completed {
                    result: stored_result.unwrap_or(Value::Null),
                }));
            }
            TaskStatus::Completed => {
                let task = Engine::transition(state, effects, &id, Transition::Rearm)?;
                tracing::info!(task = %id.short(), run = task.run_count, "recurring run rearmed");
            }
            TaskStatus::Failed if options.force => {
                Engine::transition(state, effects, &id, Transition::Reset)?;
                tracing::info!(task = %id.short(), "failed task reset for manual re-run");
            }
            TaskStatus::Failed if options.trigger != Trigger::Retry => {
                return Ok(Admission::Done(ExecutionOutcome::Failed {
                    error: last_error.unwrap_or_default(),
                    will_retry: self.retries.is_pending(&id),
                }));
            }
            TaskStatus::Failed | TaskStatus::Pending => {}
        }

        let pending = state.registry.unsatisfied_dependencies(&id);
        if !pending.is_empty() {
            return Ok(Admission::Done(ExecutionOutcome::Waiting {
                reason: "dependencies".to_string(),
                pending,
            }));
        }

        // Re-borrow after possible transitions above
        let task = state
            .registry
            .get(&id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        let scope = condition_scope(task, &options.context);
        if let Some(unmet) = condition::first_unmet(&task.automation.conditions, &scope) {
            return Ok(Admission::Done(ExecutionOutcome::Skipped {
                condition: unmet.to_string(),
            }));
        }

        let executor_name = task.automation.executor_name().to_string();
        let executor = match self.resolve_executor(&executor_name) {
            Ok(executor) => executor,
            Err(e) => {
                let error = e.to_string();
                Engine::transition(state, effects, &id, Transition::Start)?;
                let task = Engine::transition(state, effects, &id, Transition::Fail(error.clone()))?;
                state.counters.failed += 1;
                tracing::warn!(task = %id.short(), executor = %executor_name, "executor not found");
                effects.event(EngineEvent::TaskFailed {
                    task_id: id,
                    error: error.clone(),
                    attempt: task.attempts,
                    will_retry: false,
                });
                return Ok(Admission::Done(ExecutionOutcome::Failed {
                    error,
                    will_retry: false,
                }));
            }
        };

        if !reserved && !state.slots.try_acquire(id) {
            let position = state.slots.enqueue(id, options.clone());
            tracing::debug!(task = %id.short(), position, "no free slot, queued");
            effects.event(EngineEvent::TaskQueued { task_id: id, position });
            return Ok(Admission::Done(ExecutionOutcome::Queued { position }));
        }

        let task = Engine::transition(state, effects, &id, Transition::Start)?;
        tracing::info!(
            task = %id.short(),
            trigger = %options.trigger,
            attempt = task.attempts,
            executor = %executor_name,
            "task started"
        );
        effects.event(EngineEvent::TaskStarted {
            task_id: id,
            attempt: task.attempts,
        });

        let ctx = ExecutionContext {
            task_id: id,
            title: task.title.clone(),
            task_type: task.task_type.clone(),
            params: task.automation.params.clone(),
            context: options.context.clone(),
            attempt: task.attempts,
        };
        Ok(Admission::Run(Plan {
            executor,
            ctx,
            timeout: options.timeout.unwrap_or_else(|| self.config.default_timeout()),
            options: options.clone(),
        }))
    }

    /// Record an attempt's result. `None` if the task vanished meanwhile.
    fn record(
        &self,
        state: &mut EngineState,
        effects: &mut Effects,
        id: TaskId,
        attempt: u32,
        result: Result<Value>,
        options: ExecuteOptions,
    ) -> Option<ExecutionOutcome> {
        match result {
            Ok(value) => {
                let task = match Engine::transition(state, effects, &id, Transition::Complete(value.clone())) {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::debug!(task = %id.short(), error = %e, "result dropped");
                        return None;
                    }
                };
                let duration_ms = task.last_duration_ms().unwrap_or(0);
                state.counters.completed += 1;
                state.counters.execution_ms_total += duration_ms;
                tracing::info!(task = %id.short(), attempt, duration_ms, "task completed");
                effects.event(EngineEvent::TaskCompleted {
                    task_id: id,
                    result: value.clone(),
                    duration_ms,
                });

                for dependent in state.registry.ready_dependents(&id) {
                    tracing::debug!(task = %dependent.short(), prerequisite = %id.short(), "dependencies satisfied");
                    effects.spawn.push((
                        dependent,
                        ExecuteOptions::new(Trigger::Dependency),
                        false,
                    ));
                }
                Some(ExecutionOutcome::Completed { result: value })
            }
            Err(e) => {
                let error = e.to_string();
                if let Err(e) = Engine::transition(state, effects, &id, Transition::Fail(error.clone())) {
                    tracing::debug!(task = %id.short(), error = %e, "failure dropped");
                    return None;
                }
                state.counters.failed += 1;

                let will_retry = e.is_retryable() && attempt <= self.config.retry_attempts;
                if will_retry {
                    let delay = retry::backoff(self.config.retry_delay(), attempt);
                    effects.retry = Some((id, attempt, delay, options));
                    effects.event(EngineEvent::TaskRetryScheduled {
                        task_id: id,
                        attempt,
                        delay,
                    });
                }
                tracing::warn!(task = %id.short(), attempt, will_retry, error = %error, "task failed");
                effects.event(EngineEvent::TaskFailed {
                    task_id: id,
                    error: error.clone(),
                    attempt,
                    will_retry,
                });
                Some(ExecutionOutcome::Failed { error, will_retry })
            }
        }
    }
}

/// Run the executor on its own task and race it against the deadline.
///
/// On timeout the spawned operation is detached, not aborted: whatever it
/// was doing keeps running in the background.
async fn run_with_deadline(plan: Plan) -> Result<Value> {
    let Plan {
        executor,
        ctx,
        timeout,
        ..
    } = plan;
    let handle = tokio::spawn(async move { executor.execute(ctx).await });
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result.map_err(Error::into_execution_failure),
        Ok(Err(join)) => Err(Error::TaskJoin(join.to_string())),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Variables visible to a task's conditions: the caller's context plus a
/// `task` object describing the task.
pub(crate) fn condition_scope(task: &Task, context: &Value) -> Value {
    let mut scope = match context {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("context".to_string(), other.clone());
            map
        }
    };
    scope.entry("task").or_insert_with(|| {
        json!({
            "id": task.id,
            "title": task.title,
            "type": task.task_type,
            "priority": task.priority,
            "category": task.category,
            "assignee": task.assignee,
            "attempts": task.attempts,
            "params": task.automation.params,
        })
    });
    Value::Object(scope)
}
