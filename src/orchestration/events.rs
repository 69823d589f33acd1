//! Lifecycle events exposed to the hosting application.
//!
//! Events are published on a broadcast channel after the state change that
//! caused them has been applied, so subscribers always observe committed
//! state. Publishing never blocks and succeeds with zero subscribers.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::task::TaskId;
use crate::orchestration::engine::Metrics;
use crate::orchestration::health::HealthSnapshot;
use crate::workflow::{ExecutionId, WorkflowId};

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskCreated {
        task_id: TaskId,
        title: String,
    },
    TaskStarted {
        task_id: TaskId,
        /// 1-based attempt number.
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        result: Value,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        attempt: u32,
        /// Whether a retry has been queued.
        will_retry: bool,
    },
    /// No concurrency slot was free; the task waits in the FIFO queue.
    TaskQueued {
        task_id: TaskId,
        position: usize,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },
    TaskEvicted {
        task_id: TaskId,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        error: String,
    },
    Health(HealthSnapshot),
    Metrics(Metrics),
}

impl EngineEvent {
    /// Stable wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TaskCreated { .. } => "task:created",
            EngineEvent::TaskStarted { .. } => "task:started",
            EngineEvent::TaskCompleted { .. } => "task:completed",
            EngineEvent::TaskFailed { .. } => "task:failed",
            EngineEvent::TaskQueued { .. } => "task:queued",
            EngineEvent::TaskRetryScheduled { .. } => "task:retry_scheduled",
            EngineEvent::TaskEvicted { .. } => "task:evicted",
            EngineEvent::WorkflowStarted { .. } => "workflow:started",
            EngineEvent::WorkflowCompleted { .. } => "workflow:completed",
            EngineEvent::WorkflowFailed { .. } => "workflow:failed",
            EngineEvent::Health(_) => "health",
            EngineEvent::Metrics(_) => "metrics",
        }
    }

    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            EngineEvent::TaskCreated { task_id, .. }
            | EngineEvent::TaskStarted { task_id, .. }
            | EngineEvent::TaskCompleted { task_id, .. }
            | EngineEvent::TaskFailed { task_id, .. }
            | EngineEvent::TaskQueued { task_id, .. }
            | EngineEvent::TaskRetryScheduled { task_id, .. }
            | EngineEvent::TaskEvicted { task_id } => Some(*task_id),
            _ => None,
        }
    }
}

/// Broadcast fan-out of [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "publish");
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
