//! Orchestration layer for the cadence engine.
//!
//! This module holds the engine itself and the components it coordinates:
//! the single execution path, the concurrency slot pool, the delayed retry
//! queue, the cron parser and recurring scheduler, the creation-time
//! advisor, the health monitor and the event bus.

pub mod advisor;
pub mod cron;
pub(crate) mod engine;
pub(crate) mod events;
pub(crate) mod execution;
mod health;
mod retry;
mod scheduler;
mod slots;

pub use advisor::{Advice, OVERLOAD_THRESHOLD};
pub use cron::CronSchedule;
pub use engine::{Engine, EngineBuilder, Metrics};
pub use events::{EngineEvent, EventBus};
pub use execution::{ExecuteOptions, ExecutionOutcome, Trigger};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use retry::{backoff, RetryQueue};
pub use scheduler::RecurringScheduler;
pub use slots::SlotPool;
