//! Workflows: ordered steps grouped into dependency levels.
//!
//! A workflow is registered once and executed any number of times. Each
//! execution instantiates one task per step and runs it through the
//! engine's standard execution path.

pub mod level;
mod runner;
mod types;

pub use types::{
    ExecutionId, ExecutionStatus, Step, StepPolicy, StepResult, StepSpec, StepStatus, Workflow, WorkflowExecution,
    WorkflowId, WorkflowSpec,
};
