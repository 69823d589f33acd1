//! Recurring trigger integration tests.

use std::time::Duration;

use cadence::core::task::{Automation, TaskSpec, TaskStatus};
use cadence::orchestration::Engine;

use crate::fixtures::{test_config, Tracker};

/// Test: Recurring task
/// Given a task scheduled every second
/// When a few seconds pass
/// Then it runs on every fire and is rearmed between runs
#[tokio::test(start_paused = true)]
async fn test_recurring_task_runs_on_every_fire() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "reminder", Duration::ZERO);

    let task = engine
        .create_task(TaskSpec::new("send reminder").automation(Automation::with_executor("reminder").schedule("* * * * * *")))
        .unwrap();
    assert!(engine.is_scheduled(&task.id));
    // Scheduled tasks wait for their trigger instead of starting at creation
    assert_eq!(tracker.runs(), 0);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let runs = tracker.runs();
    assert!(runs >= 3, "expected at least three runs, got {}", runs);

    let task = engine.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_count as usize, runs - 1);
    assert_eq!(task.attempts, 1);
    assert_eq!(engine.get_metrics().scheduled_tasks, 1);

    assert!(engine.unschedule_task(&task.id));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(tracker.runs(), runs);
}

/// Test: Rescheduling
/// Given a task with a daily trigger
/// When it is rescheduled to every second
/// Then the new expression replaces the old one
#[tokio::test(start_paused = true)]
async fn test_reschedule_replaces_trigger() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "digest", Duration::ZERO);

    let task = engine
        .create_task(TaskSpec::new("daily digest").automation(Automation::with_executor("digest").schedule("0 8 * * *")))
        .unwrap();
    assert!(engine.schedule_task(&task.id, "* * * * * *").unwrap());
    assert_eq!(
        engine.get_task(&task.id).unwrap().automation.schedule.as_deref(),
        Some("* * * * * *")
    );

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(tracker.runs() >= 2);
    assert_eq!(engine.get_metrics().scheduled_tasks, 1);
}

/// Test: Invalid schedule
/// Given a malformed cron expression
/// When the task is created
/// Then creation fails and nothing is scheduled
#[tokio::test]
async fn test_invalid_schedule_rejected_at_creation() {
    let engine = Engine::new(test_config());
    let result = engine.create_task(TaskSpec::new("bad").automation(Automation::with_executor("default").schedule("every day")));
    assert!(matches!(result, Err(cadence::Error::Validation(_))));
    assert!(engine.list_tasks().is_empty());
    assert_eq!(engine.get_metrics().scheduled_tasks, 0);
}
