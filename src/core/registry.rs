//! Canonical in-memory store of tasks.
//!
//! The registry owns every `Task` record and the dependency graph between
//! them. All status changes go through [`TaskRegistry::transition`], which
//! enforces the lifecycle. Event emission is left to the caller so the
//! registry stays a plain, synchronously testable data structure.

use std::collections::HashMap;

use serde_json::Value;

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// A lifecycle transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// pending/failed → in_progress
    Start,
    /// in_progress → completed
    Complete(Value),
    /// in_progress → failed
    Fail(String),
    /// completed → pending, for the next recurring run
    Rearm,
    /// failed → pending, manual intervention
    Reset,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
    graph: DependencyGraph<TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task.
    ///
    /// Edges are added for dependencies that are already registered; ids
    /// that are not (yet) known stay unsatisfied until a task with that id
    /// arrives.
    ///
    /// # Errors
    /// - `Validation` if the id is already registered
    /// - `Cycle` if the dependency set would close a cycle
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!(
                "task id {} is already registered",
                task.id
            )));
        }

        let id = task.id;
        self.graph.add_node(id);
        if let Err(err) = self.link(&task) {
            self.graph.remove_node(&id);
            return Err(err);
        }
        self.tasks.insert(id, task);
        Ok(())
    }

    /// Insert or replace a task wholesale (external sync).
    pub fn upsert(&mut self, task: Task) -> Result<()> {
        if !self.tasks.contains_key(&task.id) {
            return self.insert(task);
        }
        let known: Vec<TaskId> = task
            .dependencies()
            .iter()
            .copied()
            .filter(|dep| self.graph.contains(dep))
            .collect();
        self.graph.set_prerequisites(&task.id, &known)?;
        self.tasks.insert(task.id, task);
        Ok(())
    }

    /// Add edges from known prerequisites, and from this task to any
    /// registered task that was waiting on its id.
    fn link(&mut self, task: &Task) -> Result<()> {
        for dep in task.dependencies() {
            if self.graph.contains(dep) {
                self.graph.add_dependency(dep, &task.id)?;
            }
        }
        let waiting: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|other| other.dependencies().contains(&task.id))
            .map(|other| other.id)
            .collect();
        for dependent in waiting {
            self.graph.add_dependency(&task.id, &dependent)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Apply a lifecycle transition and return the updated task.
    pub fn transition(&mut self, id: &TaskId, transition: Transition) -> Result<&Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        match transition {
            Transition::Start => task.start()?,
            Transition::Complete(result) => task.complete(result)?,
            Transition::Fail(error) => task.fail(&error)?,
            Transition::Rearm => task.rearm()?,
            Transition::Reset => task.reset()?,
        }
        Ok(task)
    }

    /// Record heuristic fields on a task.
    pub fn annotate(&mut self, id: &TaskId, f: impl FnOnce(&mut Task)) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        f(task);
        Ok(())
    }

    /// Remove a task and its graph edges.
    pub fn evict(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.graph.remove_node(id);
        Some(task)
    }

    /// Dependencies of `id` that are not completed (unknown ids included).
    pub fn unsatisfied_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(task) = self.tasks.get(id) else {
            return Vec::new();
        };
        task.dependencies()
            .iter()
            .copied()
            .filter(|dep| {
                self.tasks
                    .get(dep)
                    .map(|d| d.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Dependency ids that name no registered task.
    pub fn unknown_dependencies(&self, deps: &[TaskId]) -> Vec<TaskId> {
        deps.iter()
            .copied()
            .filter(|dep| !self.tasks.contains_key(dep))
            .collect()
    }

    /// Pending, automated dependents of `id` whose whole dependency set is
    /// now complete.
    pub fn ready_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .dependents(id)
            .into_iter()
            .filter(|dependent| {
                self.tasks
                    .get(dependent)
                    .map(|t| t.status == TaskStatus::Pending && t.automation.enabled)
                    .unwrap_or(false)
            })
            .filter(|dependent| self.unsatisfied_dependencies(dependent).is_empty())
            .collect();
        ready.sort_by_key(|dep| self.tasks.get(dep).map(|t| t.created_at));
        ready
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}
