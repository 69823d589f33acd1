//! Recurring triggers keyed by task id.
//!
//! The scheduler knows nothing about tasks beyond their id: it owns one
//! timer loop per id and invokes a callback on every cron match. The engine
//! supplies a callback that funnels into the normal execution path, so a
//! trigger never bypasses slot limits or dependency checks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::task::TaskId;
use crate::error::Result;
use crate::orchestration::cron::CronSchedule;

#[derive(Debug)]
struct Trigger {
    expression: String,
    cancel: CancellationToken,
}

/// Manages one active recurring trigger per task.
#[derive(Debug, Default)]
pub struct RecurringScheduler {
    triggers: Mutex<HashMap<TaskId, Trigger>>,
}

impl RecurringScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a trigger for `id`, cancelling the existing one (if any).
    ///
    /// `callback` is invoked on each fire; each invocation runs on its own
    /// tokio task so a slow run never delays the next fire.
    ///
    /// # Returns
    ///
    /// `true` if a previous trigger was replaced.
    ///
    /// # Errors
    ///
    /// `InvalidCron` if the expression does not parse. The previous trigger
    /// is left untouched in that case.
    pub fn schedule<F, Fut>(&self, id: TaskId, expression: &str, callback: F) -> Result<bool>
    where
        F: Fn(TaskId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schedule = CronSchedule::parse(expression)?;
        let cancel = CancellationToken::new();

        let replaced = {
            let mut triggers = lock(&self.triggers);
            let previous = triggers.insert(
                id,
                Trigger {
                    expression: schedule.expression().to_string(),
                    cancel: cancel.clone(),
                },
            );
            match previous {
                Some(old) => {
                    old.cancel.cancel();
                    true
                }
                None => false,
            }
        };

        tracing::info!(task = %id.short(), expression, replaced, "recurring trigger armed");
        tokio::spawn(run_trigger(id, schedule, cancel, Arc::new(callback)));
        Ok(replaced)
    }

    /// Remove and stop the trigger for `id`.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match lock(&self.triggers).remove(id) {
            Some(trigger) => {
                trigger.cancel.cancel();
                tracing::info!(task = %id.short(), "recurring trigger cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, trigger) in lock(&self.triggers).drain() {
            trigger.cancel.cancel();
        }
    }

    pub fn is_scheduled(&self, id: &TaskId) -> bool {
        lock(&self.triggers).contains_key(id)
    }

    pub fn expression(&self, id: &TaskId) -> Option<String> {
        lock(&self.triggers).get(id).map(|t| t.expression.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.triggers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecurringScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Timer loop for one trigger.
///
/// Fire times come from the wall clock, but sleeping is done against
/// tokio's clock anchored at loop start, so paused-time tests advance
/// through fires deterministically.
async fn run_trigger<F, Fut>(
    id: TaskId,
    schedule: CronSchedule,
    cancel: CancellationToken,
    callback: Arc<F>,
) where
    F: Fn(TaskId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let anchor_wall = Utc::now();
    let anchor = tokio::time::Instant::now();
    let mut cursor = anchor_wall;

    loop {
        let Some(next) = schedule.next_after(cursor) else {
            tracing::warn!(task = %id.short(), expression = schedule.expression(), "cron expression never fires again");
            return;
        };
        let offset = (next - anchor_wall).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(anchor + offset) => {}
        }

        tracing::debug!(task = %id.short(), at = %next, "recurring trigger fired");
        tokio::spawn((*callback)(id));
        cursor = next;
    }
}
