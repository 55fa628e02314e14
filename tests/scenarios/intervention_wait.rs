//! Test: Intervention Wait - parked nodes resolved by timeout or operator

use crate::helpers::*;
use orchestrator::core::{NodeExecution, Status};
use orchestrator::execution::{ExecutionEngine, ExecutionEvent, ScriptedStepRunner, StepOutcome};
use orchestrator::interrupt::{Interrupt, InterruptError, InterruptState, InterruptType, IssuedBy};
use orchestrator::EngineError;
use std::sync::Arc;
use uuid::Uuid;

fn operator() -> IssuedBy {
    IssuedBy::Operator {
        identity: "oncall".to_string(),
    }
}

fn intervention_plan(timeout_secs: u64) -> String {
    format!(
        r#"
id: guarded
start: deploy
nodes:
  - id: deploy
    advisers:
      - type: MANUAL_INTERVENTION
        parameters:
          timeout_secs: {}
          timeout_action: END_EXECUTION
      - type: ON_SUCCESS
        parameters:
          next_node_id: verify
  - id: verify
"#,
        timeout_secs
    )
}

/// Wait until the node is parked and its intervention timeout is recorded
async fn parked(engine: &ExecutionEngine, plan_execution_id: Uuid) -> NodeExecution {
    wait_for_node(engine, plan_execution_id, "deploy", |n| {
        n.status == Status::InterventionWaiting && !n.timeout_instance_ids.is_empty()
    })
    .await
}

/// A zero timeout applies END_EXECUTION without manual input
#[tokio::test]
async fn test_intervention_timeout_ends_plan_failed() {
    let runner = ScriptedStepRunner::new().with_outcomes("deploy", vec![StepOutcome::failed("bad rollout")]);
    let engine = engine_with_plan(&intervention_plan(0), |b| b.step_runner(Arc::new(runner))).await;
    let run = run_to_completion(&engine, request("guarded")).await;

    assert_plan_status(&run, Status::Failed);
    assert_node_ended(&run, "deploy", Status::Failed);
    assert!(run.nodes_for("verify").is_empty());
    assert_eq!(run.transitions_to(Status::InterventionWaiting), 1);
    assert!(run
        .events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::InterventionWaiting { timeout_secs: 0, .. })));

    let failure = run.execution.failure.as_ref().unwrap();
    assert_eq!(failure.setup_id, "deploy");
    assert_eq!(failure.status, Status::Failed);

    let interrupts = engine.interrupts().list_for_plan(run.execution.id);
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].interrupt_type, InterruptType::MarkFailed);
    assert!(matches!(interrupts[0].issued_by, IssuedBy::Timeout { .. }));
    assert_eq!(interrupts[0].state, InterruptState::Processed);
}

#[tokio::test]
async fn test_operator_marks_success() {
    let runner = ScriptedStepRunner::new().with_status("deploy", Status::Failed);
    let engine = engine_with_plan(&intervention_plan(3600), |b| b.step_runner(Arc::new(runner))).await;
    let events = engine.subscribe();
    let execution = engine.submit(request("guarded")).await.unwrap();

    let parked = parked(&engine, execution.id).await;
    wait_for_plan_status(&engine, execution.id, Status::InterventionWaiting).await;

    let interrupt = Interrupt::new(InterruptType::MarkSuccess, execution.id, Some(parked.id), operator());
    engine.register_interrupt(interrupt).await.unwrap();
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_node_ended(&run, "deploy", Status::Succeeded);
    assert_node_ended(&run, "verify", Status::Succeeded);
    // The intervention timeout no longer fires
    assert_eq!(engine.timeouts().pending_count(), 0);
}

#[tokio::test]
async fn test_operator_retry_runs_node_again() {
    let runner = ScriptedStepRunner::new().with_outcomes(
        "deploy",
        vec![StepOutcome::failed("first try"), StepOutcome::succeeded()],
    );
    let engine = engine_with_plan(&intervention_plan(3600), |b| b.step_runner(Arc::new(runner))).await;
    let events = engine.subscribe();
    let execution = engine.submit(request("guarded")).await.unwrap();

    let parked = parked(&engine, execution.id).await;
    let interrupt = Interrupt::new(InterruptType::Retry, execution.id, Some(parked.id), operator());
    engine.register_interrupt(interrupt).await.unwrap();
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Succeeded);
    let deploys = run.nodes_for("deploy");
    assert_eq!(deploys.len(), 2, "{}", run.summary());
    assert_eq!(deploys[0].id, parked.id);
    assert_eq!(deploys[0].status, Status::Failed);
    assert_eq!(deploys[1].retry_ids, vec![parked.id]);
    assert_node_ended(&run, "verify", Status::Succeeded);
}

#[tokio::test]
async fn test_operator_ignore_continues_chain() {
    let runner = ScriptedStepRunner::new().with_status("deploy", Status::Failed);
    let engine = engine_with_plan(&intervention_plan(3600), |b| b.step_runner(Arc::new(runner))).await;
    let events = engine.subscribe();
    let execution = engine.submit(request("guarded")).await.unwrap();

    let parked = parked(&engine, execution.id).await;
    let interrupt = Interrupt::new(InterruptType::Ignore, execution.id, Some(parked.id), operator());
    engine.register_interrupt(interrupt).await.unwrap();
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_node_ended(&run, "deploy", Status::IgnoreFailed);
    assert_node_ended(&run, "verify", Status::Succeeded);
}

/// Registering the same interrupt id twice applies it once
#[tokio::test]
async fn test_duplicate_interrupt_is_idempotent() {
    let runner = ScriptedStepRunner::new().with_status("deploy", Status::Failed);
    let engine = engine_with_plan(&intervention_plan(3600), |b| b.step_runner(Arc::new(runner))).await;
    let execution = engine.submit(request("guarded")).await.unwrap();
    let parked = parked(&engine, execution.id).await;

    let interrupt = Interrupt::new(InterruptType::MarkFailed, execution.id, Some(parked.id), operator());
    let first = engine.register_interrupt(interrupt.clone()).await.unwrap();
    let second = engine.register_interrupt(interrupt).await.unwrap();
    assert_eq!(first, second);

    let finished = wait_for_plan_status(&engine, execution.id, Status::Failed).await;
    assert_eq!(finished.failure.unwrap().node_execution_id, parked.id);
    assert_eq!(engine.interrupts().list_for_plan(execution.id).len(), 1);
}

#[tokio::test]
async fn test_interrupt_on_finished_plan_is_rejected() {
    let engine = engine_with_plan(&intervention_plan(0), |b| b).await;
    let run = run_to_completion(&engine, request("guarded")).await;
    assert_plan_status(&run, Status::Succeeded);

    let interrupt = Interrupt::new(InterruptType::AbortAll, run.execution.id, None, operator());
    let err = engine.register_interrupt(interrupt).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Interrupt(InterruptError::PlanFinished {
            status: Status::Succeeded,
            ..
        })
    ));
}
