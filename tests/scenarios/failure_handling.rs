//! Test: Failure Handling - configuration errors, dispatch failures and timeouts

use crate::helpers::*;
use orchestrator::core::Status;
use orchestrator::execution::{ScriptedStepRunner, StepOutcome};
use orchestrator::waiter::NotifyResponse;
use std::sync::Arc;

/// An adviser kind nobody knows fails the execution with a message naming it
#[tokio::test]
async fn test_unknown_adviser_fails_plan() {
    let yaml = r#"
id: broken
start: build
nodes:
  - id: build
    advisers:
      - type: TELEPORT
"#;
    let engine = engine_with_plan(yaml, |b| b).await;
    let run = run_to_completion(&engine, request("broken")).await;

    assert_plan_status(&run, Status::Failed);
    assert_all_ended(&run);
    let failure = run.execution.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.setup_id, "build");
    assert!(failure.message.as_deref().unwrap_or_default().contains("TELEPORT"));
}

#[tokio::test]
async fn test_rejected_dispatch_fails_node() {
    let yaml = r#"
id: remote
start: build
nodes:
  - id: build
    facilitator: async
    advisers:
      - type: ON_FAIL
"#;
    let executor = RecordingTaskExecutor::new();
    executor.reject_dispatches();
    let engine = engine_with_plan(yaml, |b| b.task_executor(Arc::new(executor))).await;
    let run = run_to_completion(&engine, request("remote")).await;

    assert_plan_status(&run, Status::Failed);
    let build = run.node("build");
    assert_node_ended(&run, "build", Status::Failed);
    assert!(build.failure_message.as_deref().unwrap_or_default().contains("executor offline"));
    assert_eq!(engine.waiter().pending_count(), 0);
}

/// A task that never answers is expired by the node's static timeout
#[tokio::test]
async fn test_node_timeout_expires_waiting_task() {
    let yaml = r#"
id: slow
start: build
nodes:
  - id: build
    facilitator: task
    timeout_secs: 1
    advisers:
      - type: ON_FAIL
"#;
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(yaml, |b| b.task_executor(Arc::new(executor.clone()))).await;
    let run = run_to_completion(&engine, request("slow")).await;

    assert_plan_status(&run, Status::Expired);
    assert_node_ended(&run, "build", Status::Expired);
    assert_eq!(run.advised_count(run.node("build").id), 1);

    // The task answering late changes nothing
    let (_, wait_id) = executor.dispatched().remove(0);
    assert!(!engine.waiter().resolve(&wait_id, NotifyResponse::success()));
    let node = engine.store().get_node_execution(run.node("build").id).await.unwrap().unwrap();
    assert_eq!(node.status, Status::Expired);
}

#[tokio::test]
async fn test_on_fail_continues_to_cleanup() {
    let yaml = r#"
id: guarded
start: build
nodes:
  - id: build
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: deploy
      - type: ON_FAIL
        parameters:
          next_node_id: cleanup
  - id: deploy
  - id: cleanup
"#;
    let runner = ScriptedStepRunner::new().with_outcomes("build", vec![StepOutcome::failed("compile error")]);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("guarded")).await;

    assert_eq!(run.execution_order(), vec!["build", "cleanup"]);
    assert_node_ended(&run, "build", Status::Failed);
    assert_node_ended(&run, "cleanup", Status::Succeeded);
    // The last node of the chain decides the outcome
    assert_plan_status(&run, Status::Succeeded);
}

/// A broke node without any adviser that applies aborts the plan
#[tokio::test]
async fn test_unadvised_failure_aborts_plan() {
    let yaml = r#"
id: bare
start: build
nodes:
  - id: build
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: deploy
  - id: deploy
"#;
    let runner = ScriptedStepRunner::new().with_status("build", Status::Errored);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("bare")).await;

    assert_plan_status(&run, Status::Aborted);
    assert_node_ended(&run, "build", Status::Errored);
    assert!(run.nodes_for("deploy").is_empty());
}

#[tokio::test]
async fn test_non_final_step_status_is_errored() {
    let yaml = r#"
id: odd
start: build
nodes:
  - id: build
    advisers:
      - type: ON_FAIL
"#;
    let runner = ScriptedStepRunner::new().with_status("build", Status::Running);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("odd")).await;

    assert_node_ended(&run, "build", Status::Errored);
    assert_plan_status(&run, Status::Failed);
}

/// A children parent expired by its timeout takes its live children with
/// it; the plan moves on and a late child answer changes nothing
#[tokio::test]
async fn test_expired_parent_aborts_children() {
    let yaml = r#"
id: suite
start: suite
nodes:
  - id: suite
    facilitator: children
    children: [slow]
    timeout_secs: 1
    advisers:
      - type: ON_FAIL
        parameters:
          next_node_id: after
  - id: slow
    facilitator: async
  - id: after
"#;
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(yaml, |b| b.task_executor(Arc::new(executor.clone()))).await;
    let run = run_to_completion(&engine, request("suite")).await;

    assert_node_ended(&run, "suite", Status::Expired);
    assert_node_ended(&run, "slow", Status::Aborted);
    assert_node_ended(&run, "after", Status::Succeeded);
    assert_plan_status(&run, Status::Succeeded);
    assert_all_ended(&run);

    let slow = run.node("slow");
    assert_eq!(run.advised_count(slow.id), 0);
    let (_, wait_id) = executor.dispatched().remove(0);
    assert!(slow.wait_ids.contains(&wait_id));
    assert!(!engine.waiter().is_waiting(&wait_id));
    assert_eq!(engine.waiter().pending_count(), 0);
    assert_eq!(engine.timeouts().pending_count(), 0);

    // The child answering late neither revives it nor touches the plan
    assert!(!engine.waiter().resolve(&wait_id, NotifyResponse::error("too late")));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let stored = engine.store().get_node_execution(slow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Aborted);
    let execution = engine.store().get_plan_execution(run.execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, Status::Succeeded);
}
