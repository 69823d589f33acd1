//! Core domain models for the cadence engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks, the dependency graph, the condition language and the
//! task registry.

pub mod condition;
pub mod dag;
pub mod registry;
pub mod task;

pub use condition::Condition;
pub use dag::DependencyGraph;
pub use registry::{TaskRegistry, Transition};
pub use task::{Automation, Priority, Task, TaskId, TaskSpec, TaskStatus};
