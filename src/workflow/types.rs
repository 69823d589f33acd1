//! Core workflow type definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::task::{TaskId, TaskSpec};

/// Unique identifier for a workflow definition.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for one run of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What to do after a step finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// Carry on with the remaining levels.
    Next,
    /// End the execution here.
    Stop,
}

impl std::fmt::Display for StepPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPolicy::Next => write!(f, "next"),
            StepPolicy::Stop => write!(f, "stop"),
        }
    }
}

/// Step definition as supplied to `create_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepSpec {
    /// Unique within the workflow; generated from the position when absent.
    pub id: Option<String>,
    pub name: String,
    /// Task instantiated for each execution of this step.
    pub task: TaskSpec,
    pub conditions: Vec<String>,
    /// Defaults to `next`.
    pub on_success: Option<StepPolicy>,
    /// Defaults to `stop`.
    pub on_failure: Option<StepPolicy>,
    /// Without explicit prerequisites, a parallel step does not wait for the
    /// step declared before it.
    pub parallel: bool,
    pub depends_on: Vec<String>,
}

impl StepSpec {
    pub fn new(id: &str, task: TaskSpec) -> Self {
        Self {
            id: Some(id.to_string()),
            name: id.to_string(),
            task,
            ..Default::default()
        }
    }

    pub fn condition(mut self, expression: &str) -> Self {
        self.conditions.push(expression.to_string());
        self
    }

    pub fn on_success(mut self, policy: StepPolicy) -> Self {
        self.on_success = Some(policy);
        self
    }

    pub fn on_failure(mut self, policy: StepPolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on.extend(ids.iter().map(|s| s.to_string()));
        self
    }
}

/// Workflow definition as supplied to `create_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub name: String,
    pub description: String,
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}

/// A normalized step: id assigned, policies defaulted, prerequisites
/// resolved (implicit sequencing included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub name: String,
    pub task: TaskSpec,
    pub conditions: Vec<String>,
    pub on_success: StepPolicy,
    pub on_failure: StepPolicy,
    pub parallel: bool,
    pub depends_on: Vec<String>,
}

/// A registered workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    /// Executions that ran to completion.
    pub execution_count: u64,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a step ended within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// A condition did not hold; no task ran.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one step within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    /// Task instantiated for the step; `None` when skipped before creation.
    pub task_id: Option<TaskId>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// The unmet condition, for skipped steps.
    pub condition: Option<String>,
}

impl StepResult {
    pub fn skipped(condition: &str, task_id: Option<TaskId>) -> Self {
        Self {
            status: StepStatus::Skipped,
            task_id,
            result: None,
            error: None,
            condition: Some(condition.to_string()),
        }
    }

    pub fn completed(task_id: TaskId, result: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            task_id: Some(task_id),
            result: Some(result),
            error: None,
            condition: None,
        }
    }

    pub fn failed(task_id: Option<TaskId>, error: String) -> Self {
        Self {
            status: StepStatus::Failed,
            task_id,
            result: None,
            error: Some(error),
            condition: None,
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub context: Value,
    /// Steps processed so far (completed, failed or skipped), in the order
    /// they were recorded.
    pub completed_steps: Vec<String>,
    pub step_results: BTreeMap<String, StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: WorkflowId, context: Value) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            status: ExecutionStatus::Running,
            context,
            completed_steps: Vec::new(),
            step_results: BTreeMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn record(&mut self, step_id: &str, result: StepResult) {
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.step_results.insert(step_id.to_string(), result);
    }

    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status != ExecutionStatus::Running
    }
}
