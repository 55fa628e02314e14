//! Test: Retry Behavior - failed nodes run again under a new execution

use crate::helpers::*;
use orchestrator::core::Status;
use orchestrator::execution::{ExecutionEvent, ScriptedStepRunner, StepOutcome};
use std::sync::Arc;

const RETRY_PLAN: &str = r#"
id: flaky
start: build
nodes:
  - id: build
    advisers:
      - type: RETRY
        parameters:
          retry_count: 2
          wait_intervals: [0]
      - type: ON_SUCCESS
        parameters:
          next_node_id: deploy
  - id: deploy
"#;

/// A failed node with a zero-wait retry gets a new execution whose retry
/// ids hold exactly the original runtime id
#[tokio::test]
async fn test_retry_creates_new_execution() {
    let runner = ScriptedStepRunner::new().with_outcomes(
        "build",
        vec![StepOutcome::failed("flaky network"), StepOutcome::succeeded()],
    );
    let engine = engine_with_plan(RETRY_PLAN, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("flaky")).await;

    assert_plan_status(&run, Status::Succeeded);
    let builds = run.nodes_for("build");
    assert_eq!(builds.len(), 2, "{}", run.summary());

    let (first, second) = (builds[0], builds[1]);
    assert_eq!(first.status, Status::Failed);
    assert!(first.old_retry);
    assert!(first.is_ended());
    assert_eq!(first.failure_message.as_deref(), Some("flaky network"));
    assert_eq!(second.retry_ids, vec![first.id]);
    assert_eq!(second.status, Status::Succeeded);
    assert!(!second.old_retry);
    assert_node_ended(&run, "deploy", Status::Succeeded);

    let scheduled: Vec<_> = run
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeRetryScheduled {
                node_execution_id,
                retry_of,
                attempt,
                ..
            } => Some((*node_execution_id, *retry_of, *attempt)),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![(second.id, first.id, 1)]);
}

#[tokio::test]
async fn test_retries_exhausted_end_plan_failed() {
    let runner = ScriptedStepRunner::new().with_outcomes("build", vec![StepOutcome::failed("still broken")]);
    let engine = engine_with_plan(RETRY_PLAN, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("flaky")).await;

    assert_plan_status(&run, Status::Failed);
    assert_all_ended(&run);
    assert!(run.nodes_for("deploy").is_empty());

    let builds = run.nodes_for("build");
    assert_eq!(builds.len(), 3, "{}", run.summary());
    let ids: Vec<_> = builds.iter().map(|n| n.id).collect();

    let failure = run.execution.failure.as_ref().unwrap();
    assert_eq!(failure.setup_id, "build");
    assert_eq!(failure.status, Status::Failed);
    assert_eq!(failure.node_execution_id, ids[2]);
    assert_eq!(failure.retry_chain, ids);
}

/// Retry ids only ever point at earlier executions of the same setup id
#[tokio::test]
async fn test_retry_ids_reference_earlier_attempts() {
    let runner = ScriptedStepRunner::new().with_outcomes("build", vec![StepOutcome::failed("no")]);
    let engine = engine_with_plan(RETRY_PLAN, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("flaky")).await;

    for node in &run.nodes {
        for retry_id in &node.retry_ids {
            let earlier = run
                .nodes
                .iter()
                .find(|n| n.id == *retry_id)
                .expect("retry id points at an unknown execution");
            assert_eq!(earlier.setup_id, node.setup_id);
            assert!(earlier.created_at <= node.created_at);
            assert!(earlier.old_retry);
        }
    }
}

#[tokio::test]
async fn test_retries_exhausted_then_ignored() {
    let yaml = r#"
id: tolerant
start: build
nodes:
  - id: build
    advisers:
      - type: RETRY
        parameters:
          retry_count: 1
          after_retry: IGNORE
          next_node_id: report
  - id: report
"#;
    let runner = ScriptedStepRunner::new().with_status("build", Status::Errored);
    let engine = engine_with_plan(yaml, |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("tolerant")).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_eq!(run.nodes_for("build").len(), 2);
    assert_node_ended(&run, "build", Status::IgnoreFailed);
    assert_node_ended(&run, "report", Status::Succeeded);

    let corrected = run.events.iter().any(|e| {
        matches!(
            e,
            ExecutionEvent::StatusCorrected {
                from: Status::Errored,
                to: Status::IgnoreFailed,
                ..
            }
        )
    });
    assert!(corrected, "ignoring a failure publishes the correction");
}
