//! Periodic health and metrics sampling.
//!
//! Each tick samples the engine's counters, flags tasks stuck in progress
//! and an excessive failure rate, evicts completed tasks past the
//! retention window, and broadcasts one `health` and one `metrics` event.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::engine::{Engine, Metrics};
use crate::orchestration::events::EngineEvent;

/// Overall engine health, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Result of one health tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub metrics: Metrics,
    /// Completed tasks evicted by this tick.
    pub evicted: Vec<TaskId>,
    pub timestamp: DateTime<Utc>,
}

/// Samples an engine's health on demand or on an interval.
///
/// Holds the engine weakly: a background monitor never keeps a dropped
/// engine alive.
pub struct HealthMonitor {
    engine: Weak<Engine>,
}

impl HealthMonitor {
    pub fn new(engine: &Arc<Engine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }

    /// Run one health check. `None` once the engine is gone.
    pub fn tick(&self) -> Option<HealthSnapshot> {
        let engine = self.engine.upgrade()?;
        Some(check(&engine, Utc::now()))
    }

    /// Tick every `health_check_interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.engine.upgrade()?.config().health_check_interval();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if self.tick().is_none() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        }))
    }
}

fn check(engine: &Arc<Engine>, now: DateTime<Utc>) -> HealthSnapshot {
    let config = engine.config();
    let stuck_cutoff = now - config.stuck_threshold();
    let retention_cutoff = now - config.retention();

    let (stuck, expired) = {
        let state = engine.lock_state();
        let stuck: Vec<TaskId> = state
            .registry
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| t.started_at.is_some_and(|at| at < stuck_cutoff))
            .map(|t| t.id)
            .collect();
        let expired: Vec<TaskId> = state
            .registry
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| t.completed_at.is_some_and(|at| at < retention_cutoff))
            .map(|t| t.id)
            .collect();
        (stuck, expired)
    };

    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    if !stuck.is_empty() {
        status = status.max(HealthStatus::Warning);
        issues.push(format!(
            "{} task(s) in progress for more than {} minutes",
            stuck.len(),
            config.stuck_threshold().num_minutes()
        ));
    }

    let mut evicted = Vec::new();
    for id in expired {
        if engine.evict_expired(&id, retention_cutoff).is_some() {
            evicted.push(id);
        }
    }
    if !evicted.is_empty() {
        tracing::info!(count = evicted.len(), "evicted completed tasks past retention");
    }

    let metrics = engine.get_metrics();
    if metrics.tasks_created > 0 {
        let rate = metrics.tasks_failed as f64 / metrics.tasks_created as f64;
        if rate > config.failure_rate_threshold {
            status = status.max(HealthStatus::Critical);
            issues.push(format!(
                "failure rate {:.1}% exceeds {:.1}%",
                rate * 100.0,
                config.failure_rate_threshold * 100.0
            ));
        }
    }

    if let Some(gateway) = engine.gateway() {
        if let Err(e) = gateway.record_metrics(&metrics) {
            tracing::warn!(error = %e, "failed to persist metrics");
        }
    }

    match status {
        HealthStatus::Healthy => tracing::debug!("health check passed"),
        _ => tracing::warn!(%status, issues = ?issues, "health check reported issues"),
    }

    let snapshot = HealthSnapshot {
        status,
        issues,
        metrics: metrics.clone(),
        evicted,
        timestamp: now,
    };
    engine.events.publish(EngineEvent::Health(snapshot.clone()));
    engine.events.publish(EngineEvent::Metrics(metrics));
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::registry::Transition;
    use crate::core::task::{Automation, TaskSpec};
    use crate::error::Error;
    use chrono::Duration;
    use serde_json::Value;

    fn manual(title: &str) -> TaskSpec {
        let mut automation = Automation::with_executor("default");
        automation.enabled = false;
        TaskSpec::new(title).automation(automation)
    }

    #[tokio::test]
    async fn test_healthy_engine() {
        let engine = Engine::new(EngineConfig::default());
        engine.create_task(manual("a")).unwrap();
        let snapshot = HealthMonitor::new(&engine).tick().unwrap();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.issues.is_empty());
        assert_eq!(snapshot.metrics.tasks_created, 1);
    }

    #[tokio::test]
    async fn test_stuck_task_is_warning() {
        let engine = Engine::new(EngineConfig::default());
        let task = engine.create_task(manual("a")).unwrap();
        {
            let mut state = engine.lock_state();
            state.registry.transition(&task.id, Transition::Start).unwrap();
            state
                .registry
                .annotate(&task.id, |t| t.started_at = Some(Utc::now() - Duration::hours(2)))
                .unwrap();
        }
        let snapshot = HealthMonitor::new(&engine).tick().unwrap();
        assert_eq!(snapshot.status, HealthStatus::Warning);
        assert!(snapshot.issues[0].contains("in progress"));
    }

    #[tokio::test]
    async fn test_failure_rate_is_critical() {
        let engine = Engine::new(EngineConfig {
            retry_attempts: 0,
            ..Default::default()
        });
        engine.register_executor_fn("boom", |_| async { Err::<Value, _>(Error::Executor("boom".into())) });
        let mut automation = Automation::with_executor("boom");
        automation.enabled = false;
        let task = engine.create_task(TaskSpec::new("a").automation(automation)).unwrap();
        engine
            .execute_task(task.id, crate::orchestration::execution::ExecuteOptions::manual())
            .await
            .unwrap();

        let snapshot = HealthMonitor::new(&engine).tick().unwrap();
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert!(snapshot.issues.iter().any(|i| i.contains("failure rate")));
    }

    #[tokio::test]
    async fn test_retention_evicts_old_completed_tasks() {
        let engine = Engine::new(EngineConfig::default());
        let old = engine.create_task(manual("old")).unwrap();
        let fresh = engine.create_task(manual("fresh")).unwrap();
        {
            let mut state = engine.lock_state();
            for id in [old.id, fresh.id] {
                state.registry.transition(&id, Transition::Start).unwrap();
                state.registry.transition(&id, Transition::Complete(Value::Null)).unwrap();
            }
            state
                .registry
                .annotate(&old.id, |t| t.completed_at = Some(Utc::now() - Duration::days(45)))
                .unwrap();
        }
        let snapshot = HealthMonitor::new(&engine).tick().unwrap();
        assert_eq!(snapshot.evicted, vec![old.id]);
        assert!(engine.get_task(&old.id).is_none());
        assert!(engine.get_task(&fresh.id).is_some());
    }

    #[tokio::test]
    async fn test_rerun_after_scan_is_not_evicted() {
        let engine = Engine::new(EngineConfig::default());
        let task = engine.create_task(manual("weekly check-in")).unwrap();
        let cutoff = Utc::now() - Duration::days(30);
        {
            let mut state = engine.lock_state();
            state.registry.transition(&task.id, Transition::Start).unwrap();
            state.registry.transition(&task.id, Transition::Complete(Value::Null)).unwrap();
            state
                .registry
                .annotate(&task.id, |t| t.completed_at = Some(Utc::now() - Duration::days(45)))
                .unwrap();
            // Rearmed and started again after the expiry scan
            state.registry.transition(&task.id, Transition::Rearm).unwrap();
            state.registry.transition(&task.id, Transition::Start).unwrap();
        }
        assert!(engine.evict_expired(&task.id, cutoff).is_none());
        assert_eq!(engine.get_task(&task.id).unwrap().status, TaskStatus::InProgress);

        {
            let mut state = engine.lock_state();
            state.registry.transition(&task.id, Transition::Complete(Value::Null)).unwrap();
        }
        // Completed again but inside the retention window
        assert!(engine.evict_expired(&task.id, cutoff).is_none());
        assert!(engine.evict_expired(&TaskId::new(), cutoff).is_none());

        {
            let mut state = engine.lock_state();
            state
                .registry
                .annotate(&task.id, |t| t.completed_at = Some(Utc::now() - Duration::days(45)))
                .unwrap();
        }
        assert!(engine.evict_expired(&task.id, cutoff).is_some());
        assert!(engine.get_task(&task.id).is_none());
    }

    #[tokio::test]
    async fn test_tick_broadcasts_health_and_metrics() {
        let engine = Engine::new(EngineConfig::default());
        let mut rx = engine.subscribe();
        HealthMonitor::new(&engine).tick().unwrap();
        assert_eq!(rx.recv().await.unwrap().name(), "health");
        assert_eq!(rx.recv().await.unwrap().name(), "metrics");
    }

    #[tokio::test]
    async fn test_tick_after_engine_dropped() {
        let engine = Engine::new(EngineConfig::default());
        let monitor = HealthMonitor::new(&engine);
        drop(engine);
        assert!(monitor.tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_stops_on_cancel() {
        let engine = Engine::new(EngineConfig {
            health_check_interval_secs: 10,
            ..Default::default()
        });
        let mut rx = engine.subscribe();
        let cancel = CancellationToken::new();
        let handle = HealthMonitor::new(&engine).spawn(cancel.clone()).unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut health_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "health" {
                health_events += 1;
            }
        }
        assert_eq!(health_events, 2);
    }
}
