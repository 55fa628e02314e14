//! Test: Success Chain - nodes hand over to their successors

use crate::helpers::*;
use orchestrator::core::Status;
use orchestrator::execution::{ExecutionEvent, LoopbackTaskExecutor};
use orchestrator::waiter::WaitNotifyEngine;
use std::sync::Arc;
use std::time::Duration;

/// A completes SUCCEEDED, B starts, B completes SUCCEEDED, the plan succeeds
#[tokio::test]
async fn test_two_node_chain_succeeds() {
    let yaml = r#"
id: chain
start: a
nodes:
  - id: a
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: b
  - id: b
"#;
    let engine = engine_with_plan(yaml, |b| b).await;
    let run = run_to_completion(&engine, request("chain")).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_eq!(run.execution_order(), vec!["a", "b"]);
    assert_node_ended(&run, "a", Status::Succeeded);
    assert_node_ended(&run, "b", Status::Succeeded);
    assert!(run.execution.failure.is_none());
    assert!(run.execution.end_ts.is_some());

    let a = run.node("a");
    let b = run.node("b");
    assert!(b.start_ts.unwrap() >= a.end_ts.unwrap(), "b started before a ended");
    assert_eq!(b.parent_id, None);
    assert_eq!(b.ambiance.depth(), 1);
    assert_eq!(b.ambiance.obtain_current_setup_id(), Some("b"));
    assert_eq!(b.ambiance.account_id(), Some("acc"));
    assert_eq!(b.ambiance.pipeline_id(), Some("pipe"));
}

#[tokio::test]
async fn test_each_node_is_advised_once() {
    let yaml = r#"
id: three
start: a
nodes:
  - id: a
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: b
  - id: b
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: c
  - id: c
"#;
    let engine = engine_with_plan(yaml, |b| b).await;
    let run = run_to_completion(&engine, request("three")).await;

    assert_plan_status(&run, Status::Succeeded);
    for node in &run.nodes {
        assert_eq!(run.advised_count(node.id), 1, "{}", run.summary());
    }
    let completed = run
        .events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::PlanCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_async_node_resumes_through_waiter() {
    let yaml = r#"
id: remote
start: build
nodes:
  - id: build
    facilitator: async
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: publish
  - id: publish
    facilitator: task
"#;
    let engine = engine_with_plan(yaml, |b| b).await;
    let run = run_to_completion(&engine, request("remote")).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_all_ended(&run);
    assert_eq!(run.node("build").wait_ids.len(), 1);
    assert_eq!(run.transitions_to(Status::AsyncWaiting), 1);
    assert_eq!(run.transitions_to(Status::TaskWaiting), 1);
    assert_eq!(engine.waiter().pending_count(), 0);
}

#[tokio::test]
async fn test_children_complete_parent() {
    let yaml = r#"
id: fanout
start: tests
nodes:
  - id: tests
    facilitator: children
    children: [unit, lint]
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: ship
  - id: unit
    facilitator: async
  - id: lint
  - id: ship
"#;
    let waiter = WaitNotifyEngine::new();
    let executor = LoopbackTaskExecutor::new(waiter.clone()).with_delay(Duration::from_millis(5));
    let engine = engine_with_plan(yaml, |b| b.waiter(waiter).task_executor(Arc::new(executor))).await;
    let run = run_to_completion(&engine, request("fanout")).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_all_ended(&run);
    let parent = run.node("tests");
    for child in ["unit", "lint"] {
        let node = run.node(child);
        assert_eq!(node.parent_id, Some(parent.id));
        assert_eq!(node.ambiance.depth(), 2);
        assert_eq!(node.ambiance.obtain_parent_runtime_id(), Some(parent.id));
        assert!(node.end_ts.unwrap() <= parent.end_ts.unwrap());
    }
    assert_node_ended(&run, "ship", Status::Succeeded);
    assert_eq!(run.node("ship").parent_id, None);
}
