//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Engine configs with short delays
//! - Task specs with automation enabled or disabled
//! - A tracker executor that tracks how many runs overlap

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cadence::config::EngineConfig;
use cadence::core::task::{Automation, TaskId, TaskSpec, TaskStatus};
use cadence::executor::ExecutionContext;
use cadence::orchestration::Engine;

/// Defaults with retry delays short enough for paused-time tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_delay_ms: 100,
        default_timeout_secs: 5,
        ..Default::default()
    }
}

/// Task that starts on its own once its dependencies are met.
pub fn auto(title: &str, executor: &str) -> TaskSpec {
    TaskSpec::new(title).automation(Automation::with_executor(executor))
}

/// Task that only runs when executed explicitly.
pub fn manual(title: &str, executor: &str) -> TaskSpec {
    let mut automation = Automation::with_executor(executor);
    automation.enabled = false;
    TaskSpec::new(title).automation(automation)
}

pub fn status(engine: &Engine, id: &TaskId) -> Option<TaskStatus> {
    engine.get_task(id).map(|t| t.status)
}

/// Poll `check` every 10ms, giving up after 10 seconds of (possibly paused) time.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Executor that sleeps for a fixed delay and records overlap.
#[derive(Debug, Default)]
pub struct Tracker {
    runs: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    /// Register a tracker executor under `name`.
    ///
    /// Each run returns the task title and the params it was given.
    pub fn install(engine: &Arc<Engine>, name: &str, delay: Duration) -> Arc<Tracker> {
        let tracker = Arc::new(Tracker::default());
        let p = tracker.clone();
        engine.register_executor_fn(name, move |ctx: ExecutionContext| {
            let p = p.clone();
            async move {
                p.runs.fetch_add(1, Ordering::SeqCst);
                let now = p.running.fetch_add(1, Ordering::SeqCst) + 1;
                p.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                p.running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, cadence::Error>(json!({"title": ctx.title, "params": ctx.params}))
            }
        });
        tracker
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
