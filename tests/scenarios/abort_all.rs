//! Test: Abort All - tearing down every live node of a plan

use crate::helpers::*;
use orchestrator::core::Status;
use orchestrator::execution::{ExecutionEvent, ScriptedStepRunner};
use orchestrator::interrupt::{Interrupt, InterruptType, IssuedBy};
use orchestrator::waiter::{NotifyResponse, WaitNotifyEngine};
use std::sync::Arc;
use std::time::Duration;

const FANOUT: &str = r#"
id: fanout
start: suite
nodes:
  - id: suite
    facilitator: children
    children: [unit, e2e, lint]
  - id: unit
    facilitator: async
  - id: e2e
    facilitator: async
  - id: lint
    facilitator: task
"#;

/// ABORT_ALL over N live nodes produces exactly N ABORTED transitions and
/// none of those nodes is advised afterwards
#[tokio::test]
async fn test_abort_all_aborts_every_live_node() {
    let waiter = WaitNotifyEngine::new();
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(FANOUT, |b| {
        b.waiter(waiter.clone()).task_executor(Arc::new(executor.clone()))
    })
    .await;
    let events = engine.subscribe();
    let execution = engine.submit(request("fanout")).await.unwrap();

    let dispatched = executor.wait_for_dispatches(3).await;
    for setup_id in ["unit", "e2e"] {
        wait_for_node_status(&engine, execution.id, setup_id, Status::AsyncWaiting).await;
    }
    wait_for_node_status(&engine, execution.id, "lint", Status::TaskWaiting).await;

    let interrupt = Interrupt::new(
        InterruptType::AbortAll,
        execution.id,
        None,
        IssuedBy::Operator {
            identity: "release-manager".to_string(),
        },
    );
    engine.register_interrupt(interrupt).await.unwrap();

    // Late task responses find no correlation
    for (_, wait_id) in &dispatched {
        assert!(!waiter.resolve(wait_id, NotifyResponse::success()));
    }
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Aborted);
    assert_all_ended(&run);
    assert_eq!(run.nodes.len(), 4);
    assert_eq!(run.transitions_to(Status::Discontinuing), 4);
    assert_eq!(run.transitions_to(Status::Aborted), 4);
    for node in &run.nodes {
        assert_eq!(node.status, Status::Aborted);
        assert_eq!(run.advised_count(node.id), 0, "{}", run.summary());
    }
    let completed: Vec<_> = run
        .events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::PlanCompleted { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn test_abort_adviser_ends_plan_aborted() {
    let yaml = r#"
id: strict
start: check
nodes:
  - id: check
    advisers:
      - type: ABORT
      - type: ON_SUCCESS
        parameters:
          next_node_id: ship
  - id: ship
"#;
    let runner = ScriptedStepRunner::new().with_status("check", Status::Errored);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("strict")).await;

    assert_plan_status(&run, Status::Aborted);
    assert_node_ended(&run, "check", Status::Errored);
    assert!(run.nodes_for("ship").is_empty());

    let failure = run.execution.failure.as_ref().unwrap();
    assert_eq!(failure.setup_id, "check");
    assert_eq!(failure.status, Status::Errored);

    let interrupts = engine.interrupts().list_for_plan(run.execution.id);
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].issued_by, IssuedBy::Adviser);
}

/// A retry waiting on its interval is aborted and never starts
#[tokio::test]
async fn test_abort_cancels_pending_retry() {
    let yaml = r#"
id: patient
start: build
nodes:
  - id: build
    advisers:
      - type: RETRY
        parameters:
          retry_count: 3
          wait_intervals: [300]
"#;
    let runner = ScriptedStepRunner::new().with_status("build", Status::Failed);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let events = engine.subscribe();
    let execution = engine.submit(request("patient")).await.unwrap();

    let queued = wait_for_node(&engine, execution.id, "build", |n| {
        n.status == Status::Queued && !n.timeout_instance_ids.is_empty()
    })
    .await;
    let interrupt = Interrupt::new(
        InterruptType::AbortAll,
        execution.id,
        None,
        IssuedBy::Operator {
            identity: "ops".to_string(),
        },
    );
    engine.register_interrupt(interrupt).await.unwrap();
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Aborted);
    let retried = run.nodes.iter().find(|n| n.id == queued.id).unwrap();
    assert_eq!(retried.status, Status::Aborted);
    assert!(retried.start_ts.is_none());
    assert_eq!(engine.timeouts().pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.store().list_children(execution.id).await.unwrap().len(), 2);
}
