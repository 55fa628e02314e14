//! Test: Approval - criteria-evaluated long polling

use crate::helpers::*;
use async_trait::async_trait;
use orchestrator::approval::ApprovalStatus;
use orchestrator::core::Status;
use orchestrator::execution::{LoopbackTaskExecutor, TaskError, TaskExecutor, TaskHandle, TaskSpec};
use orchestrator::waiter::{NotifyResponse, WaitNotifyEngine};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn approval_plan(timeout_secs: u64) -> String {
    format!(
        r#"
id: release
start: gate
nodes:
  - id: gate
    step_type: APPROVAL
    approval:
      approval_criteria:
        type: key_values
        conditions:
          - key: Status
            operator: equals
            value: APPROVED
      rejection_criteria:
        type: expression
        expression: Status == REJECTED
      retry_interval_secs: 1
      timeout_secs: {}
    advisers:
      - type: ON_SUCCESS
        parameters:
          next_node_id: ship
      - type: ON_FAIL
  - id: ship
"#,
        timeout_secs
    )
}

fn gate_output(status: &str) -> HashMap<String, Map<String, Value>> {
    let mut output = Map::new();
    output.insert("Status".to_string(), Value::String(status.to_string()));
    HashMap::from([("gate".to_string(), output)])
}

/// Answers each poll with the next status in line; the last one repeats
struct ScriptedApprovals {
    waiter: WaitNotifyEngine,
    answers: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl TaskExecutor for ScriptedApprovals {
    async fn dispatch(&self, _spec: TaskSpec, wait_id: &str) -> Result<TaskHandle, TaskError> {
        let answer = {
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                *answers.front().unwrap()
            }
        };
        let waiter = self.waiter.clone();
        let wait_id = wait_id.to_string();
        tokio::spawn(async move {
            waiter.resolve(&wait_id, NotifyResponse::success().with_value("Status", answer));
        });
        Ok(TaskHandle {
            task_id: "approval".to_string(),
        })
    }
}

/// A rejected output finalizes the approval REJECTED and the node is
/// advised exactly once
#[tokio::test]
async fn test_rejection_criteria_finalize_once() {
    let waiter = WaitNotifyEngine::new();
    let executor = LoopbackTaskExecutor::new(waiter.clone())
        .with_delay(Duration::from_millis(5))
        .with_outputs(gate_output("REJECTED"));
    let engine = engine_with_plan(&approval_plan(60), |b| {
        b.waiter(waiter).task_executor(Arc::new(executor))
    })
    .await;
    let run = run_to_completion(&engine, request("release")).await;

    assert_plan_status(&run, Status::Failed);
    assert_node_ended(&run, "gate", Status::ApprovalRejected);
    assert!(run.nodes_for("ship").is_empty());

    let gate = run.node("gate");
    assert_eq!(run.advised_count(gate.id), 1);

    assert_eq!(run.approval_outcomes(), vec![(ApprovalStatus::Rejected, 1)]);
    // Settled approvals are not kept around
    assert!(engine.approvals().for_node(gate.id).is_empty());
    assert!(engine.approvals().is_empty());
}

#[tokio::test]
async fn test_approved_output_continues_chain() {
    let waiter = WaitNotifyEngine::new();
    let executor = LoopbackTaskExecutor::new(waiter.clone())
        .with_delay(Duration::from_millis(5))
        .with_outputs(gate_output("APPROVED"));
    let engine = engine_with_plan(&approval_plan(60), |b| {
        b.waiter(waiter).task_executor(Arc::new(executor))
    })
    .await;
    let run = run_to_completion(&engine, request("release")).await;

    assert_plan_status(&run, Status::Succeeded);
    assert_node_ended(&run, "gate", Status::Succeeded);
    assert_node_ended(&run, "ship", Status::Succeeded);
    assert_eq!(run.transitions_to(Status::ApprovalWaiting), 1);

    assert_eq!(run.approval_outcomes(), vec![(ApprovalStatus::Approved, 1)]);
    assert!(engine.approvals().is_empty());
    // Deadline and poll timeouts are gone with the node
    assert_eq!(engine.timeouts().pending_count(), 0);
}

#[tokio::test]
async fn test_pending_output_polls_again() {
    let waiter = WaitNotifyEngine::new();
    let executor = ScriptedApprovals {
        waiter: waiter.clone(),
        answers: Mutex::new(VecDeque::from(["WAITING", "APPROVED"])),
    };
    let engine = engine_with_plan(&approval_plan(60), |b| {
        b.waiter(waiter).task_executor(Arc::new(executor))
    })
    .await;
    let run = run_to_completion(&engine, request("release")).await;

    assert_plan_status(&run, Status::Succeeded);
    let gate = run.node("gate");
    assert_eq!(gate.wait_ids.len(), 2);
    assert_eq!(run.approval_outcomes(), vec![(ApprovalStatus::Approved, 2)]);
    assert_eq!(run.advised_count(gate.id), 1);
}

/// Nobody answers: the deadline expires the approval and the node
#[tokio::test]
async fn test_deadline_expires_approval() {
    let waiter = WaitNotifyEngine::new();
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(&approval_plan(1), |b| {
        b.waiter(waiter.clone()).task_executor(Arc::new(executor.clone()))
    })
    .await;
    let run = run_to_completion(&engine, request("release")).await;

    assert_plan_status(&run, Status::Expired);
    assert_node_ended(&run, "gate", Status::Expired);

    let gate = run.node("gate");
    assert_eq!(run.approval_outcomes().len(), 1);
    assert_eq!(run.approval_outcomes()[0].0, ApprovalStatus::Expired);
    assert_eq!(run.advised_count(gate.id), 1);
    assert!(engine.approvals().is_empty());

    // An answer arriving after the deadline is dropped
    let (_, wait_id) = executor.dispatched().remove(0);
    assert!(!waiter.resolve(&wait_id, NotifyResponse::success().with_value("Status", "APPROVED")));
}

/// The gate disappears from the saved plan while its approval is still
/// polling: the next poll fails the plan as a configuration error
#[tokio::test]
async fn test_poll_for_removed_node_fails_plan() {
    let waiter = WaitNotifyEngine::new();
    let executor = ScriptedApprovals {
        waiter: waiter.clone(),
        answers: Mutex::new(VecDeque::from(["WAITING"])),
    };
    let engine = engine_with_plan(&approval_plan(60), |b| {
        b.waiter(waiter).task_executor(Arc::new(executor))
    })
    .await;
    let events = engine.subscribe();
    let execution = engine.submit(request("release")).await.unwrap();
    wait_for_node_status(&engine, execution.id, "gate", Status::ApprovalWaiting).await;

    let without_gate = r#"
id: release
start: ship
nodes:
  - id: ship
"#;
    engine.save_plan(&plan_from_yaml(without_gate)).await.unwrap();
    let run = finish(&engine, execution.id, events).await;

    assert_plan_status(&run, Status::Failed);
    assert_node_ended(&run, "gate", Status::Failed);
    let failure = run.execution.failure.as_ref().expect("failure recorded");
    assert_eq!(failure.setup_id, "gate");
    assert!(failure.message.as_deref().unwrap_or_default().contains("gate"));

    assert!(run.approval_outcomes().is_empty());
    assert!(engine.approvals().is_empty());
    assert_eq!(engine.timeouts().pending_count(), 0);
}
