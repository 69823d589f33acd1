//! Task data model.
//!
//! A task is a unit of work with a lifecycle, an optional automation
//! descriptor (which executor runs it, when, and under which conditions)
//! and the heuristic fields filled in by the advisor at creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output. Identifiers are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Declared urgency of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending → in_progress → {completed | failed}`; a failed task may go
/// back to `in_progress` when it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started.
    #[default]
    Pending,
    /// An executor is running for this task.
    InProgress,
    /// Finished successfully.
    Completed,
    /// The last attempt failed.
    Failed,
}

impl TaskStatus {
    /// Whether the forward lifecycle allows moving to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed) | (Failed, InProgress)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a task is automated: which executor runs it, with what params,
/// on which schedule, gated by which conditions and dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Automation {
    pub enabled: bool,
    /// Executor name; `None` runs the default no-op executor.
    pub executor: Option<String>,
    pub params: Value,
    /// Cron expression for recurring execution.
    pub schedule: Option<String>,
    /// Boolean expressions that must all hold for the task to run.
    pub conditions: Vec<String>,
    /// Tasks that must be completed before this one may run.
    pub dependencies: Vec<TaskId>,
}

impl Automation {
    /// Enabled automation running the named executor.
    pub fn with_executor(executor: &str) -> Self {
        Self {
            enabled: true,
            executor: Some(executor.to_string()),
            ..Default::default()
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn schedule(mut self, expression: &str) -> Self {
        self.schedule = Some(expression.to_string());
        self
    }

    pub fn condition(mut self, expression: &str) -> Self {
        self.conditions.push(expression.to_string());
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn executor_name(&self) -> &str {
        self.executor.as_deref().unwrap_or(crate::executor::DEFAULT_EXECUTOR)
    }
}

/// Task creation input.
///
/// Field names follow the external (camelCase) shape so a JSON body from
/// the hosting application deserializes directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: Priority,
    pub category: String,
    pub owner_entity_id: Option<String>,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub automation: Automation,
}

impl TaskSpec {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn task_type(mut self, task_type: &str) -> Self {
        self.task_type = task_type.to_string();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn owner(mut self, owner_entity_id: &str) -> Self {
        self.owner_entity_id = Some(owner_entity_id.to_string());
        self
    }

    pub fn assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    pub fn due(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn automation(mut self, automation: Automation) -> Self {
        self.automation = automation;
        self
    }

    /// Field-level validation. Cron and condition syntax are checked by the
    /// registry, which owns those parsers.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        let automation = &self.automation;
        if automation.enabled {
            if let Some(executor) = &automation.executor {
                if executor.trim().is_empty() {
                    return Err(Error::Validation(
                        "automation.executor must not be empty".to_string(),
                    ));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &automation.dependencies {
            if !seen.insert(dep) {
                return Err(Error::Validation(format!(
                    "duplicate dependency {}",
                    dep
                )));
            }
        }
        if let Some(schedule) = &automation.schedule {
            if schedule.trim().is_empty() {
                return Err(Error::Validation(
                    "automation.schedule must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub owner_entity_id: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub automation: Automation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// Execution attempts in the current run (reset when a recurring task rearms).
    #[serde(default)]
    pub attempts: u32,
    /// Completed recurring runs before the current one.
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Heuristic urgency, 0..=100.
    #[serde(default)]
    pub priority_score: u8,
    #[serde(default)]
    pub estimated_duration_minutes: u32,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Task {
    /// Create a pending task from validated creation input.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: spec.title.trim().to_string(),
            description: spec.description,
            task_type: spec.task_type,
            priority: spec.priority,
            status: TaskStatus::Pending,
            category: spec.category,
            owner_entity_id: spec.owner_entity_id,
            assignee: spec.assignee,
            due_date: spec.due_date,
            automation: spec.automation,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            attempts: 0,
            run_count: 0,
            last_error: None,
            result: None,
            priority_score: 0,
            estimated_duration_minutes: 0,
            suggestions: Vec::new(),
        }
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.automation.dependencies
    }

    fn check_transition(&self, next: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Begin an execution attempt.
    ///
    /// Valid from pending (first attempt) or failed (retry). Increments the
    /// attempt counter.
    pub fn start(&mut self) -> Result<()> {
        self.check_transition(TaskStatus::InProgress)?;
        let now = Utc::now();
        self.status = TaskStatus::InProgress;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Mark the running attempt as successful.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.check_transition(TaskStatus::Completed)?;
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.last_error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Mark the running attempt as failed.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.check_transition(TaskStatus::Failed)?;
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.to_string());
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Start a new recurring run of a completed task.
    ///
    /// Completed → pending, attempts reset, run counter incremented.
    pub fn rearm(&mut self) -> Result<()> {
        if self.status != TaskStatus::Completed {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.run_count += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Manual intervention on a permanently failed task: failed → pending
    /// with a fresh attempt budget.
    pub fn reset(&mut self) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Milliseconds spent in the most recent attempt, if it has finished.
    pub fn last_duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let finished = match self.status {
            TaskStatus::Completed => self.completed_at?,
            TaskStatus::Failed => self.failed_at?,
            _ => return None,
        };
        Some((finished - started).num_milliseconds().max(0))
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Take the descriptive fields of `other`, keeping this record's run
    /// state (status, attempts, timestamps and result).
    pub fn merge_details(&mut self, other: Task) {
        self.title = other.title;
        self.description = other.description;
        self.task_type = other.task_type;
        self.priority = other.priority;
        self.category = other.category;
        self.owner_entity_id = other.owner_entity_id;
        self.assignee = other.assignee;
        self.due_date = other.due_date;
        self.automation = other.automation;
        self.estimated_duration_minutes = other.estimated_duration_minutes;
        self.updated_at = other.updated_at;
    }
}
