//! End-to-end workflow integration tests.
//!
//! These tests verify leveled execution, context propagation, step
//! conditions and the success/failure policies of complete workflows.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cadence::config::EngineConfig;
use cadence::core::task::{Automation, TaskSpec};
use cadence::orchestration::{Engine, EngineEvent};
use cadence::persistence::PersistenceGateway;
use cadence::workflow::{ExecutionStatus, StepPolicy, StepSpec, StepStatus, WorkflowSpec};
use cadence::Error;

use crate::fixtures::{test_config, Tracker};

fn template(title: &str, executor: &str) -> TaskSpec {
    TaskSpec::new(title).automation(Automation::with_executor(executor))
}

/// Test: Parallel fan-in
/// Given two parallel booking steps and an invitation step after both
/// When the workflow executes
/// Then the bookings overlap and the invitations see the workflow context
#[tokio::test(start_paused = true)]
async fn test_parallel_steps_then_fan_in() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "book", Duration::from_millis(100));

    let workflow = engine
        .create_workflow(
            WorkflowSpec::new("wedding")
                .step(StepSpec::new("venue", template("Book venue", "book")))
                .step(StepSpec::new("catering", template("Book catering", "book")).parallel())
                .step(
                    StepSpec::new("invites", template("Send invites", "book"))
                        .depends_on(&["venue", "catering"])
                        .condition("steps.venue.status == 'completed'"),
                ),
        )
        .unwrap();

    let execution = engine
        .execute_workflow(&workflow.id, json!({"guests": 120}))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.error.is_none());
    assert_eq!(tracker.runs(), 3);
    assert_eq!(tracker.peak(), 2, "venue and catering should run together");
    assert_eq!(execution.completed_steps.last().map(String::as_str), Some("invites"));

    let invites = &execution.step_results["invites"];
    assert_eq!(invites.status, StepStatus::Completed);
    let result = invites.result.as_ref().unwrap();
    assert_eq!(result["title"], "Send invites");
    assert_eq!(result["params"]["guests"], 120);

    // Step tasks are ordinary tasks in the registry
    let task_id = invites.task_id.unwrap();
    assert!(engine.get_task(&task_id).unwrap().is_finished());

    assert_eq!(engine.get_workflow(&workflow.id).unwrap().execution_count, 1);
    assert_eq!(engine.get_metrics().workflows_executed, 1);
    assert_eq!(engine.get_execution(&execution.id).unwrap(), execution);
}

/// Test: Step conditions
/// Given a step gated on the budget
/// When the budget is too small
/// Then the step is skipped without creating a task and later steps still run
#[tokio::test]
async fn test_condition_skips_step_and_continues() {
    let engine = Engine::new(test_config());
    let tracker = Tracker::install(&engine, "book", Duration::ZERO);

    let workflow = engine
        .create_workflow(
            WorkflowSpec::new("reception")
                .step(StepSpec::new("band", template("Book band", "book")).condition("budget > 10000"))
                .step(StepSpec::new("playlist", template("Build playlist", "book"))),
        )
        .unwrap();

    let execution = engine
        .execute_workflow(&workflow.id, json!({"budget": 5000}))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let band = &execution.step_results["band"];
    assert_eq!(band.status, StepStatus::Skipped);
    assert_eq!(band.condition.as_deref(), Some("budget > 10000"));
    assert!(band.task_id.is_none());
    assert_eq!(execution.step_results["playlist"].status, StepStatus::Completed);
    assert_eq!(tracker.runs(), 1);
    assert_eq!(engine.list_tasks().len(), 1);
}

/// Test: Failure policy
/// Given a failing deposit step with the default stop policy
/// When the workflow executes
/// Then the execution fails and later steps never run
#[tokio::test]
async fn test_failed_step_stops_execution() {
    let config = EngineConfig {
        retry_attempts: 0,
        ..test_config()
    };
    let gateway = Arc::new(PersistenceGateway::in_memory(&config));
    let engine = Engine::builder(config).gateway(gateway.clone()).build();
    engine.register_executor_fn("declined", |_| async {
        Err::<Value, _>(Error::Executor("card declined".into()))
    });
    let tracker = Tracker::install(&engine, "book", Duration::ZERO);
    let mut rx = engine.subscribe();

    let workflow = engine
        .create_workflow(
            WorkflowSpec::new("deposits")
                .step(StepSpec::new("deposit", template("Pay deposit", "declined")))
                .step(StepSpec::new("confirm", template("Confirm booking", "book"))),
        )
        .unwrap();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.as_deref().unwrap();
    assert!(error.starts_with("step 'deposit' failed"), "unexpected error: {}", error);
    assert!(!execution.step_results.contains_key("confirm"));
    assert_eq!(tracker.runs(), 0);
    assert_eq!(engine.get_workflow(&workflow.id).unwrap().execution_count, 0);
    assert_eq!(engine.get_metrics().workflows_executed, 0);

    let stored = gateway.load_executions().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ExecutionStatus::Failed);

    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::WorkflowFailed { execution_id, .. } = event {
            assert_eq!(execution_id, execution.id);
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

/// Test: Continue and stop-on-success policies
/// Given an optional step allowed to fail and a step that ends the workflow
/// When the workflow executes
/// Then the failure is recorded, the stopping step completes the execution
/// and the trailing step never runs
#[tokio::test]
async fn test_continue_on_failure_and_stop_on_success() {
    let engine = Engine::new(EngineConfig {
        retry_attempts: 0,
        ..test_config()
    });
    engine.register_executor_fn("declined", |_| async {
        Err::<Value, _>(Error::Executor("no availability".into()))
    });
    let tracker = Tracker::install(&engine, "book", Duration::ZERO);

    let workflow = engine
        .create_workflow(
            WorkflowSpec::new("photographer")
                .step(StepSpec::new("first-choice", template("Ask first choice", "declined")).on_failure(StepPolicy::Next))
                .step(StepSpec::new("backup", template("Book backup", "book")).on_success(StepPolicy::Stop))
                .step(StepSpec::new("third-choice", template("Ask third choice", "book"))),
        )
        .unwrap();
    let execution = engine.execute_workflow(&workflow.id, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.step_results["first-choice"].status, StepStatus::Failed);
    assert_eq!(execution.step_results["backup"].status, StepStatus::Completed);
    assert!(!execution.step_results.contains_key("third-choice"));
    assert_eq!(tracker.runs(), 1);
}

/// Test: Invalid definitions
/// Given workflows with a cycle or an unknown step reference
/// When they are created
/// Then creation fails and nothing is registered
#[tokio::test]
async fn test_invalid_workflow_definitions_rejected() {
    let engine = Engine::new(test_config());

    let cycle = WorkflowSpec::new("cycle")
        .step(StepSpec::new("a", template("a", "default")).depends_on(&["b"]))
        .step(StepSpec::new("b", template("b", "default")).depends_on(&["a"]));
    assert!(matches!(engine.create_workflow(cycle), Err(Error::Cycle(_))));

    let dangling = WorkflowSpec::new("dangling")
        .step(StepSpec::new("a", template("a", "default")).depends_on(&["missing"]));
    assert!(matches!(engine.create_workflow(dangling), Err(Error::Validation(_))));

    assert!(engine.list_workflows().is_empty());
}
