//! Task execution integration tests.
//!
//! These tests verify that dependency fan-out, the global concurrency
//! limit, retries with backoff and executor deadlines work together.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cadence::config::EngineConfig;
use cadence::core::task::{Automation, TaskSpec, TaskStatus};
use cadence::orchestration::{Engine, EngineEvent, ExecuteOptions, ExecutionOutcome};
use cadence::Error;

use crate::fixtures::{auto, manual, status, test_config, wait_until, Tracker};

/// Test: Dependency fan-out and fan-in
/// Given venue -> (catering, decor) -> rehearsal
/// When venue completes
/// Then both middle tasks run and rehearsal starts only after both finished
#[tokio::test(start_paused = true)]
async fn test_dependency_fan_out_and_fan_in() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "book", Duration::from_millis(50));

    let venue = engine.create_task(auto("venue", "book")).unwrap();
    let catering = engine
        .create_task(TaskSpec::new("catering").automation(Automation::with_executor("book").depends_on([venue.id])))
        .unwrap();
    let decor = engine
        .create_task(TaskSpec::new("decor").automation(Automation::with_executor("book").depends_on([venue.id])))
        .unwrap();
    let rehearsal = engine
        .create_task(
            TaskSpec::new("rehearsal")
                .automation(Automation::with_executor("book").depends_on([catering.id, decor.id])),
        )
        .unwrap();

    // Nothing has run yet: the last task reports what it waits for
    match engine.execute_task(rehearsal.id, ExecuteOptions::manual()).await.unwrap() {
        ExecutionOutcome::Waiting { reason, pending } => {
            assert_eq!(reason, "dependencies");
            assert!(pending.contains(&catering.id));
            assert!(pending.contains(&decor.id));
        }
        other => panic!("expected waiting, got {:?}", other),
    }

    assert!(wait_until(|| status(&engine, &rehearsal.id) == Some(TaskStatus::Completed)).await);
    assert_eq!(tracker.runs(), 4);
    assert_eq!(tracker.peak(), 2, "catering and decor should overlap");

    let catering = engine.get_task(&catering.id).unwrap();
    let decor = engine.get_task(&decor.id).unwrap();
    let rehearsal = engine.get_task(&rehearsal.id).unwrap();
    assert!(rehearsal.started_at >= catering.completed_at);
    assert!(rehearsal.started_at >= decor.completed_at);
    assert_eq!(engine.get_metrics().tasks_completed, 4);
}

/// Test: Concurrency limit
/// Given a limit of two slots and five ready tasks
/// When they are created together
/// Then at most two run at once and every task eventually completes
#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_queues_excess_tasks() {
    let engine = Engine::new(EngineConfig {
        max_concurrent_tasks: 2,
        ..test_config()
    });
    let tracker = Tracker::install(&engine, "slow", Duration::from_millis(100));

    let ids: Vec<_> = (0..5)
        .map(|i| engine.create_task(auto(&format!("task {}", i), "slow")).unwrap().id)
        .collect();

    assert!(wait_until(|| ids.iter().all(|id| status(&engine, id) == Some(TaskStatus::Completed))).await);
    assert_eq!(tracker.runs(), 5);
    assert_eq!(tracker.peak(), 2);
    assert_eq!(engine.peak_in_flight(), 2);
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.get_metrics().queued_tasks, 0);
}

/// Test: Queue order
/// Given a single slot
/// When four tasks become ready in order
/// Then they start in the same order
#[tokio::test(start_paused = true)]
async fn test_queued_tasks_start_in_fifo_order() {
    let engine = Engine::new(EngineConfig {
        max_concurrent_tasks: 1,
        ..test_config()
    });
    Tracker::install(&engine, "slow", Duration::from_millis(20));
    let mut rx = engine.subscribe();

    let ids: Vec<_> = (0..4)
        .map(|i| engine.create_task(auto(&format!("task {}", i), "slow")).unwrap().id)
        .collect();
    assert!(wait_until(|| ids.iter().all(|id| status(&engine, id) == Some(TaskStatus::Completed))).await);

    let mut started = Vec::new();
    let mut queued = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::TaskStarted { task_id, .. } => started.push(task_id),
            EngineEvent::TaskQueued { .. } => queued += 1,
            _ => {}
        }
    }
    assert_eq!(started, ids);
    assert_eq!(queued, 3);
}

/// Test: Retry with backoff
/// Given an executor that fails twice before succeeding
/// When the task runs to completion
/// Then it is retried with linearly growing delays and completes
#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
    let engine = Engine::new(test_config());
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    engine.register_executor_fn("flaky", move |_| {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n < 3 {
                Err(Error::Executor(format!("attempt {} failed", n)))
            } else {
                Ok(json!({"attempt": n}))
            }
        }
    });
    let mut rx = engine.subscribe();

    let task = engine.create_task(manual("flaky vendor call", "flaky")).unwrap();
    let outcome = engine
        .run_to_completion(task.id, ExecuteOptions::manual())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Completed { result: json!({"attempt": 3}) });
    let task = engine.get_task(&task.id).unwrap();
    assert_eq!(task.attempts, 3);
    assert!(task.last_error.is_none());

    let mut delays = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::TaskRetryScheduled { delay, .. } = event {
            delays.push(delay);
        }
    }
    assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);

    let metrics = engine.get_metrics();
    assert_eq!(metrics.tasks_failed, 2);
    assert_eq!(metrics.tasks_completed, 1);
}

/// Test: Retry budget
/// Given one allowed retry and an executor that always fails
/// When the task runs to completion
/// Then it stays failed and only a forced run executes it again
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_need_force() {
    let engine = Engine::new(EngineConfig {
        retry_attempts: 1,
        ..test_config()
    });
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    engine.register_executor_fn("down", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err::<Value, _>(Error::Executor("service unavailable".into())) }
    });

    let task = engine.create_task(manual("ping vendor", "down")).unwrap();
    let outcome = engine
        .run_to_completion(task.id, ExecuteOptions::manual())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Failed {
            error: "Executor failed: service unavailable".to_string(),
            will_retry: false,
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A plain re-run reports the failure without executing
    let again = engine.execute_task(task.id, ExecuteOptions::manual()).await.unwrap();
    assert!(matches!(again, ExecutionOutcome::Failed { will_retry: false, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let forced = engine
        .execute_task(task.id, ExecuteOptions::manual().force())
        .await
        .unwrap();
    assert!(matches!(forced, ExecutionOutcome::Failed { will_retry: true, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.get_task(&task.id).unwrap().attempts, 1);
}

/// Test: Timeout
/// Given an executor slower than the deadline
/// When the deadline passes
/// Then the task fails while the operation itself keeps running
#[tokio::test(start_paused = true)]
async fn test_timeout_fails_task_but_operation_continues() {
    let engine = Engine::new(EngineConfig {
        retry_attempts: 0,
        ..test_config()
    });
    let finished = Arc::new(AtomicBool::new(false));
    let f = finished.clone();
    engine.register_executor_fn("upload", move |_| {
        let f = f.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            f.store(true, Ordering::SeqCst);
            Ok::<_, Error>(Value::Null)
        }
    });

    let task = engine.create_task(manual("upload photos", "upload")).unwrap();
    let outcome = engine
        .run_to_completion(task.id, ExecuteOptions::manual().timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    match outcome {
        ExecutionOutcome::Failed { error, will_retry } => {
            assert!(error.contains("timed out"), "unexpected error: {}", error);
            assert!(!will_retry);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(engine.in_flight(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(status(&engine, &task.id), Some(TaskStatus::Failed));
}

/// Test: Concurrent callers
/// Given a running task
/// When it is executed again
/// Then the second call reports it as running instead of starting it twice
#[tokio::test(start_paused = true)]
async fn test_execute_while_running_does_not_duplicate() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "slow", Duration::from_millis(200));
    let task = engine.create_task(manual("print menus", "slow")).unwrap();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute_task(task.id, ExecuteOptions::manual()).await })
    };
    assert!(wait_until(|| status(&engine, &task.id) == Some(TaskStatus::InProgress)).await);

    let second = engine.execute_task(task.id, ExecuteOptions::manual()).await.unwrap();
    assert_eq!(second, ExecutionOutcome::Running);

    let first = runner.await.unwrap().unwrap();
    assert!(first.is_completed());
    assert_eq!(tracker.runs(), 1);
}
