//! Delayed retry queue.
//!
//! A failed attempt is re-run after `base × attempt`. Waiting retries hold
//! no concurrency slot, and each entry is cancellable so a retry can never
//! fire for a task that has since been evicted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::task::TaskId;

/// Linear backoff: the retry after attempt `n` waits `base × n`.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

#[derive(Debug)]
struct PendingRetry {
    generation: u64,
    attempt: u32,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<TaskId, PendingRetry>,
    generation: u64,
}

/// Cancellable delayed retries, at most one per task.
#[derive(Debug, Default)]
pub struct RetryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` after `delay` unless cancelled first. Replaces any
    /// retry already pending for `id`.
    pub fn schedule<F, Fut>(&self, id: TaskId, attempt: u32, delay: Duration, callback: F)
    where
        F: FnOnce(TaskId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            let generation = inner.generation;
            let previous = inner.pending.insert(
                id,
                PendingRetry {
                    generation,
                    attempt,
                    cancel: cancel.clone(),
                },
            );
            if let Some(old) = previous {
                old.cancel.cancel();
            }
            generation
        };

        tracing::debug!(
            task = %id.short(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Only fire if this entry is still the current one for the task
            let current = {
                let mut inner = lock(&inner);
                match inner.pending.get(&id) {
                    Some(retry) if retry.generation == generation => {
                        inner.pending.remove(&id);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                callback(id).await;
            }
        });
    }

    /// Cancel the pending retry for `id`.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match lock(&self.inner).pending.remove(id) {
            Some(retry) => {
                retry.cancel.cancel();
                tracing::debug!(task = %id.short(), attempt = retry.attempt, "retry cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, retry) in lock(&self.inner).pending.drain() {
            retry.cancel.cancel();
        }
    }

    pub fn is_pending(&self, id: &TaskId) -> bool {
        lock(&self.inner).pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
