pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod log;
pub mod orchestration;
pub mod persistence;
pub mod workflow;

pub use config::EngineConfig;
pub use core::{Automation, Priority, Task, TaskId, TaskSpec, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{Engine, EngineEvent, ExecuteOptions, ExecutionOutcome, HealthMonitor, Metrics, Trigger};
pub use persistence::{ChangeNotification, PersistenceGateway};
pub use workflow::{StepPolicy, StepSpec, WorkflowExecution, WorkflowId, WorkflowSpec};
