//! Durable storage for tasks, workflows, executions and metrics.
//!
//! The [`Store`] trait is the storage seam; [`MemoryStore`] backs tests and
//! engines without a database, [`SqliteStore`] backs the CLI. The
//! [`PersistenceGateway`] sits in front of a store with a read-through
//! cache and the change feed that keeps the engine in sync with other
//! writers.

mod gateway;
mod sqlite;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::Metrics;
use crate::workflow::{ExecutionId, Workflow, WorkflowExecution, WorkflowId};

pub use gateway::{ChangeNotification, PersistenceGateway};
pub use sqlite::SqliteStore;

/// One terminal transition of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            timestamp: task.updated_at,
            status: task.status,
            attempt: task.attempts,
            result: task.result.clone(),
            error: task.last_error.clone(),
        }
    }
}

/// A task as stored: the task itself plus its bounded execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default)]
    pub execution_history: Vec<HistoryEntry>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            execution_history: Vec::new(),
        }
    }

    /// Append a history entry, dropping the oldest beyond `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.execution_history.push(entry);
        if self.execution_history.len() > limit {
            let excess = self.execution_history.len() - limit;
            self.execution_history.drain(..excess);
        }
    }
}

/// A persisted metrics sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub recorded_at: DateTime<Utc>,
    pub metrics: Metrics,
}

/// Durable storage backend.
///
/// Writes are upserts keyed by entity id. Implementations must be safe to
/// share across threads.
pub trait Store: Send + Sync {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()>;
    fn load_task(&self, id: &TaskId) -> Result<Option<TaskRecord>>;
    fn load_tasks(&self) -> Result<Vec<TaskRecord>>;
    /// Returns whether a record was removed.
    fn delete_task(&self, id: &TaskId) -> Result<bool>;

    fn upsert_workflow(&self, workflow: &Workflow) -> Result<()>;
    fn load_workflows(&self) -> Result<Vec<Workflow>>;

    fn upsert_execution(&self, execution: &WorkflowExecution) -> Result<()>;
    fn load_executions(&self) -> Result<Vec<WorkflowExecution>>;

    fn append_metrics(&self, sample: &MetricsSample) -> Result<()>;
    /// Most recent samples, newest first.
    fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricsSample>>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    tasks: HashMap<TaskId, TaskRecord>,
    workflows: HashMap<WorkflowId, Workflow>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    metrics: Vec<MetricsSample>,
}

/// In-process store.
///
/// Writes can be made to fail on demand, to exercise persistence-failure
/// paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Persistence("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Store for MemoryStore {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
        self.check_writable()?;
        self.tables().tasks.insert(record.task.id, record.clone());
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.tables().tasks.get(id).cloned())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self.tables().tasks.values().cloned().collect();
        records.sort_by_key(|r| r.task.created_at);
        Ok(records)
    }

    fn delete_task(&self, id: &TaskId) -> Result<bool> {
        self.check_writable()?;
        Ok(self.tables().tasks.remove(id).is_some())
    }

    fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.check_writable()?;
        self.tables().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn load_workflows(&self) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self.tables().workflows.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    fn upsert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.check_writable()?;
        self.tables().executions.insert(execution.id, execution.clone());
        Ok(())
    }

    fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self.tables().executions.values().cloned().collect();
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }

    fn append_metrics(&self, sample: &MetricsSample) -> Result<()> {
        self.check_writable()?;
        self.tables().metrics.push(sample.clone());
        Ok(())
    }

    fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricsSample>> {
        Ok(self.tables().metrics.iter().rev().take(limit).cloned().collect())
    }
}
