//! Workflow registration and level-by-level execution.
//!
//! Every step becomes an ordinary task and runs through
//! [`Engine::run_to_completion`], so steps share the global slot pool and
//! the retry policy with every other task. A wide level can therefore
//! partially queue.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};

use crate::core::condition;
use crate::core::task::TaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::events::EngineEvent;
use crate::orchestration::execution::{ExecuteOptions, ExecutionOutcome, Trigger};
use crate::orchestration::Engine;
use crate::workflow::level;
use crate::workflow::types::{
    ExecutionId, ExecutionStatus, Step, StepPolicy, StepResult, StepStatus, Workflow, WorkflowExecution,
    WorkflowId, WorkflowSpec,
};

impl Engine {
    /// Register a workflow.
    ///
    /// # Errors
    ///
    /// `Validation` for a missing name, duplicate or unknown step ids,
    /// malformed step templates or conditions; `Cycle` for circular step
    /// prerequisites.
    pub fn create_workflow(&self, spec: WorkflowSpec) -> Result<Workflow> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("workflow name is required".to_string()));
        }
        let steps = level::normalize(spec.steps)?;
        let workflow = Workflow {
            id: WorkflowId::new(),
            name: spec.name.trim().to_string(),
            description: spec.description,
            steps,
            created_at: chrono::Utc::now(),
            execution_count: 0,
        };

        self.lock_state().workflows.insert(workflow.id, workflow.clone());
        self.persist_workflow(&workflow);
        tracing::info!(
            workflow = %workflow.id.short(),
            name = %workflow.name,
            steps = workflow.steps.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> Option<Workflow> {
        self.lock_state().workflows.get(id).cloned()
    }

    /// All workflows, oldest first.
    pub fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.lock_state().workflows.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Option<WorkflowExecution> {
        self.lock_state().executions.get(id).cloned()
    }

    /// Executions, oldest first, optionally restricted to one workflow.
    pub fn list_executions(&self, workflow: Option<&WorkflowId>) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> = self
            .lock_state()
            .executions
            .values()
            .filter(|e| workflow.map_or(true, |id| &e.workflow_id == id))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    /// Execute a workflow level by level.
    ///
    /// All steps of a level start together and are awaited together before
    /// the next level begins. A failed step whose `on_failure` policy is
    /// `stop` fails the execution; a completed step whose `on_success`
    /// policy is `stop` completes it early. Step failures are recorded in
    /// the returned execution, not returned as errors.
    ///
    /// # Errors
    ///
    /// `WorkflowNotFound` for an unknown id.
    pub async fn execute_workflow(self: &Arc<Self>, id: &WorkflowId, context: Value) -> Result<WorkflowExecution> {
        let workflow = self
            .get_workflow(id)
            .ok_or_else(|| Error::WorkflowNotFound(id.to_string()))?;
        let levels = level::levels(&workflow.steps)?;

        let mut execution = WorkflowExecution::new(workflow.id, context);
        self.store_execution(&execution);
        tracing::info!(
            workflow = %workflow.id.short(),
            execution = %execution.id.short(),
            levels = levels.len(),
            "workflow started"
        );
        self.events.publish(EngineEvent::WorkflowStarted {
            workflow_id: workflow.id,
            execution_id: execution.id,
        });

        for (n, level) in levels.iter().enumerate() {
            let scope = step_scope(&execution);
            tracing::debug!(execution = %execution.id.short(), level = n, steps = level.len(), "level started");

            let runs = level.iter().map(|&i| self.run_step(&workflow.steps[i], &scope));
            let results = join_all(runs).await;

            let mut failed_stop = None;
            let mut success_stop = false;
            for (&i, result) in level.iter().zip(results) {
                let step = &workflow.steps[i];
                match result.status {
                    StepStatus::Failed if step.on_failure == StepPolicy::Stop && failed_stop.is_none() => {
                        failed_stop = Some(format!(
                            "step '{}' failed: {}",
                            step.id,
                            result.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                    StepStatus::Completed if step.on_success == StepPolicy::Stop => success_stop = true,
                    _ => {}
                }
                execution.record(&step.id, result);
            }

            if let Some(error) = failed_stop {
                execution.finish(ExecutionStatus::Failed, Some(error));
                break;
            }
            if success_stop {
                tracing::debug!(execution = %execution.id.short(), level = n, "stopped early on success policy");
                execution.finish(ExecutionStatus::Completed, None);
                break;
            }
            self.store_execution(&execution);
        }

        if !execution.is_finished() {
            execution.finish(ExecutionStatus::Completed, None);
        }
        self.finish_execution(&execution);
        Ok(execution)
    }

    async fn run_step(self: &Arc<Self>, step: &Step, scope: &Value) -> StepResult {
        if let Some(unmet) = condition::first_unmet(&step.conditions, scope) {
            tracing::debug!(step = %step.id, condition = unmet, "step skipped");
            return StepResult::skipped(unmet, None);
        }

        let task = match self.register_task(instantiate(step, scope), false) {
            Ok(task) => task,
            Err(e) => return StepResult::failed(None, e.to_string()),
        };

        let options = ExecuteOptions::new(Trigger::Workflow).context(scope.clone());
        match self.run_to_completion(task.id, options).await {
            Ok(ExecutionOutcome::Completed { result }) => StepResult::completed(task.id, result),
            Ok(ExecutionOutcome::Failed { error, .. }) => StepResult::failed(Some(task.id), error),
            Ok(ExecutionOutcome::Skipped { condition }) => StepResult::skipped(&condition, Some(task.id)),
            Ok(other) => StepResult::failed(Some(task.id), format!("step ended {}", other.status())),
            Err(e) => StepResult::failed(Some(task.id), e.to_string()),
        }
    }

    fn store_execution(&self, execution: &WorkflowExecution) {
        self.lock_state().executions.insert(execution.id, execution.clone());
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save_execution(execution) {
                tracing::warn!(execution = %execution.id.short(), error = %e, "failed to persist execution");
            }
        }
    }

    fn finish_execution(&self, execution: &WorkflowExecution) {
        let workflow = {
            let mut state = self.lock_state();
            state.executions.insert(execution.id, execution.clone());
            if execution.status == ExecutionStatus::Completed {
                state.counters.workflows_executed += 1;
                state.workflows.get_mut(&execution.workflow_id).map(|w| {
                    w.execution_count += 1;
                    w.clone()
                })
            } else {
                None
            }
        };
        if let Some(workflow) = &workflow {
            self.persist_workflow(workflow);
        }
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save_execution(execution) {
                tracing::warn!(execution = %execution.id.short(), error = %e, "failed to persist execution");
            }
        }

        match execution.status {
            ExecutionStatus::Failed => {
                let error = execution.error.clone().unwrap_or_default();
                tracing::warn!(execution = %execution.id.short(), error = %error, "workflow failed");
                self.events.publish(EngineEvent::WorkflowFailed {
                    workflow_id: execution.workflow_id,
                    execution_id: execution.id,
                    error,
                });
            }
            _ => {
                tracing::info!(
                    execution = %execution.id.short(),
                    steps = execution.completed_steps.len(),
                    "workflow completed"
                );
                self.events.publish(EngineEvent::WorkflowCompleted {
                    workflow_id: execution.workflow_id,
                    execution_id: execution.id,
                });
            }
        }
    }

    fn persist_workflow(&self, workflow: &Workflow) {
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save_workflow(workflow) {
                tracing::warn!(workflow = %workflow.id.short(), error = %e, "failed to persist workflow");
            }
        }
    }
}

/// The execution context plus `steps.<id>.{status,result}` for every step
/// processed so far.
fn step_scope(execution: &WorkflowExecution) -> Value {
    let mut scope = match &execution.context {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("context".to_string(), other.clone());
            map
        }
    };
    let steps: Map<String, Value> = execution
        .step_results
        .iter()
        .map(|(id, result)| {
            let mut entry = Map::new();
            entry.insert("status".to_string(), Value::String(result.status.to_string()));
            entry.insert("result".to_string(), result.result.clone().unwrap_or(Value::Null));
            (id.clone(), Value::Object(entry))
        })
        .collect();
    scope.insert("steps".to_string(), Value::Object(steps));
    Value::Object(scope)
}

/// Build the task for one run of `step`: the template with the workflow
/// context merged under its params. Ordering comes from levels, so
/// template dependencies and schedules are dropped.
fn instantiate(step: &Step, scope: &Value) -> TaskSpec {
    let mut spec = step.task.clone();
    spec.automation.schedule = None;
    spec.automation.dependencies.clear();

    let mut params = match scope {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("steps");
            map
        }
        _ => Map::new(),
    };
    match std::mem::take(&mut spec.automation.params) {
        Value::Object(own) => params.extend(own),
        Value::Null => {}
        other => {
            params.insert("value".to_string(), other);
        }
    }
    spec.automation.params = Value::Object(params);
    spec
}
