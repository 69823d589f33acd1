//! Persistence and recovery integration tests.
//!
//! These tests verify that tasks and workflows survive a restart through
//! the SQLite store, that interrupted work is marked failed on reload,
//! that pushed change notifications reach the engine, and that the health
//! monitor reports into the store.

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cadence::config::EngineConfig;
use cadence::core::task::{Task, TaskSpec, TaskStatus};
use cadence::orchestration::{Engine, ExecuteOptions, HealthMonitor, HealthStatus};
use cadence::persistence::{ChangeNotification, PersistenceGateway};
use cadence::workflow::{ExecutionStatus, StepSpec, WorkflowSpec};
use cadence::Error;

use crate::fixtures::{manual, test_config, wait_until};

fn sqlite_config(temp: &TempDir) -> EngineConfig {
    EngineConfig {
        database_path: Some(temp.path().join("cadence.db").to_string_lossy().into_owned()),
        ..test_config()
    }
}

fn open_engine(config: &EngineConfig) -> (Arc<PersistenceGateway>, Arc<Engine>) {
    let gateway = Arc::new(PersistenceGateway::open(config).unwrap());
    let engine = Engine::builder(config.clone()).gateway(gateway.clone()).build();
    (gateway, engine)
}

/// Test: Restart
/// Given a completed task and a registered workflow in SQLite
/// When a new engine loads the database
/// Then both are back in memory with their results and history
#[tokio::test]
async fn test_tasks_and_workflows_survive_restart() {
    let temp = TempDir::new().unwrap();
    let config = sqlite_config(&temp);

    let (task_id, workflow_id) = {
        let (_gateway, engine) = open_engine(&config);
        let task = engine.create_task(manual("Book venue", "default")).unwrap();
        let outcome = engine
            .run_to_completion(task.id, ExecuteOptions::manual())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        let workflow = engine
            .create_workflow(WorkflowSpec::new("plan").step(StepSpec::new("venue", TaskSpec::new("Book venue"))))
            .unwrap();
        engine.shutdown();
        (task.id, workflow.id)
    };

    let (gateway, engine) = open_engine(&config);
    assert_eq!(engine.load_persisted().unwrap(), 1);

    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"executed": true})));
    assert_eq!(engine.get_workflow(&workflow_id).unwrap().name, "plan");

    let history = gateway.history(&task_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TaskStatus::Completed);

    // The stored result is returned without running again
    let again = engine.execute_task(task_id, ExecuteOptions::manual()).await.unwrap();
    assert!(again.is_completed());
    assert_eq!(engine.get_metrics().tasks_completed, 0);
}

/// Test: Interrupted work
/// Given a task and an execution persisted mid-run
/// When the engine loads them
/// Then both are marked failed instead of staying in progress forever
#[tokio::test]
async fn test_interrupted_work_is_failed_on_load() {
    let temp = TempDir::new().unwrap();
    let config = sqlite_config(&temp);

    let task_id = {
        let (gateway, engine) = open_engine(&config);
        let workflow = engine
            .create_workflow(WorkflowSpec::new("plan").step(StepSpec::new("venue", TaskSpec::new("Book venue"))))
            .unwrap();
        let execution = cadence::workflow::WorkflowExecution::new(workflow.id, json!({}));
        gateway.save_execution(&execution).unwrap();

        let mut task = Task::from_spec(TaskSpec::new("Print programs"));
        task.start().unwrap();
        gateway.save_task(&task, false).unwrap();
        task.id
    };

    let (gateway, engine) = open_engine(&config);
    engine.load_persisted().unwrap();

    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("interrupted by restart"));
    assert_eq!(gateway.history(&task_id).unwrap().len(), 1);

    let executions = engine.list_executions(None);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(gateway.load_executions().unwrap()[0].status, ExecutionStatus::Failed);
}

/// Test: Push sync
/// Given the change feed consumer is running
/// When another writer pushes insert, update and delete notifications
/// Then the engine registry follows them
#[tokio::test]
async fn test_pushed_changes_reach_engine() {
    let config = test_config();
    let gateway = Arc::new(PersistenceGateway::in_memory(&config));
    let engine = Engine::builder(config).gateway(gateway.clone()).build();
    let cancel = CancellationToken::new();
    let handle = gateway.spawn_sync(&engine, cancel.clone()).unwrap();
    assert!(gateway.spawn_sync(&engine, cancel.clone()).is_none());

    let sender = gateway.sender();
    let mut task = Task::from_spec(TaskSpec::new("Order flowers"));
    let id = task.id;
    sender.send(ChangeNotification::Insert(task.clone())).await.unwrap();
    assert!(wait_until(|| engine.get_task(&id).is_some()).await);

    task.title = "Order peonies".to_string();
    task.updated_at = chrono::Utc::now();
    sender.send(ChangeNotification::Update(task)).await.unwrap();
    assert!(wait_until(|| engine.get_task(&id).map(|t| t.title) == Some("Order peonies".to_string())).await);

    sender.send(ChangeNotification::Delete(id)).await.unwrap();
    assert!(wait_until(|| engine.get_task(&id).is_none()).await);

    cancel.cancel();
    handle.await.unwrap();
}

/// Test: Health reporting
/// Given every created task has failed
/// When the monitor ticks
/// Then the status is critical and a metrics sample is stored
#[tokio::test]
async fn test_health_tick_reports_failures_and_records_metrics() {
    let config = EngineConfig {
        retry_attempts: 0,
        ..test_config()
    };
    let gateway = Arc::new(PersistenceGateway::in_memory(&config));
    let engine = Engine::builder(config).gateway(gateway.clone()).build();
    engine.register_executor_fn("broken", |_| async { Err::<Value, _>(Error::Executor("broken".into())) });

    for title in ["Call florist", "Call baker"] {
        let task = engine.create_task(manual(title, "broken")).unwrap();
        engine
            .run_to_completion(task.id, ExecuteOptions::manual())
            .await
            .unwrap();
    }

    let snapshot = HealthMonitor::new(&engine).tick().unwrap();
    assert_eq!(snapshot.status, HealthStatus::Critical);
    assert_eq!(snapshot.metrics.tasks_failed, 2);

    let samples = gateway.recent_metrics(5).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].metrics, snapshot.metrics);
}
