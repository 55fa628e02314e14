//! Test: Admission - executions queue behind a pipeline's ceiling

use crate::helpers::*;
use orchestrator::core::config::EngineConfig;
use orchestrator::core::Status;
use orchestrator::execution::{AccountTier, AdmissionConfig, ExecutionEvent};
use orchestrator::waiter::NotifyResponse;
use std::sync::Arc;

const PLAN: &str = r#"
id: deploy
start: rollout
nodes:
  - id: rollout
    facilitator: async
"#;

fn single_slot_config() -> EngineConfig {
    EngineConfig {
        admission: AdmissionConfig {
            free: 1,
            ..Default::default()
        },
        default_tier: Some(AccountTier::Free),
        ..Default::default()
    }
}

/// With one running execution on a free account, a second submission is
/// queued and starts once the first finishes
#[tokio::test]
async fn test_second_execution_waits_for_first() {
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(PLAN, |b| {
        b.config(single_slot_config()).task_executor(Arc::new(executor.clone()))
    })
    .await;
    let events = engine.subscribe();

    let first = engine.submit(request("deploy")).await.unwrap();
    assert_eq!(first.status, Status::Running);
    let dispatched = executor.wait_for_dispatches(1).await;

    let second = engine.submit(request("deploy")).await.unwrap();
    assert_eq!(second.status, Status::Queued);
    assert!(engine.admission().should_queue("acc", "pipe").await.should_queue);
    // Other pipelines are not affected
    assert!(!engine.admission().should_queue("acc", "elsewhere").await.should_queue);

    // Nothing of the queued execution has started yet
    assert!(engine.store().list_children(second.id).await.unwrap().is_empty());
    assert_eq!(executor.dispatched().len(), 1);

    assert!(engine.waiter().resolve(&dispatched[0].1, NotifyResponse::success()));
    let first_run = finish(&engine, first.id, engine.subscribe()).await;
    assert_plan_status(&first_run, Status::Succeeded);

    let dispatched = executor.wait_for_dispatches(2).await;
    wait_for_plan_status(&engine, second.id, Status::Running).await;
    assert!(engine.waiter().resolve(&dispatched[1].1, NotifyResponse::success()));
    let second_run = finish(&engine, second.id, events).await;

    assert_plan_status(&second_run, Status::Succeeded);
    assert!(second_run
        .events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::PlanQueued { .. })));
    assert!(!engine.admission().should_queue("acc", "pipe").await.should_queue);
}

#[tokio::test]
async fn test_higher_tier_is_not_queued() {
    let mut config = single_slot_config();
    config.account_tiers.insert("bigco".to_string(), AccountTier::Enterprise);
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(PLAN, |b| b.config(config).task_executor(Arc::new(executor.clone()))).await;

    engine.submit(request_for("deploy", "acc", "pipe")).await.unwrap();
    executor.wait_for_dispatches(1).await;

    let queued = engine.submit(request_for("deploy", "acc", "pipe")).await.unwrap();
    let admitted = engine.submit(request_for("deploy", "bigco", "pipe")).await.unwrap();
    assert_eq!(queued.status, Status::Queued);
    assert_eq!(admitted.status, Status::Running);
    executor.wait_for_dispatches(2).await;
}

/// Queued executions start in submission order
#[tokio::test]
async fn test_queue_is_first_in_first_out() {
    let executor = RecordingTaskExecutor::new();
    let engine = engine_with_plan(PLAN, |b| {
        b.config(single_slot_config()).task_executor(Arc::new(executor.clone()))
    })
    .await;

    let first = engine.submit(request("deploy")).await.unwrap();
    let dispatched = executor.wait_for_dispatches(1).await;
    let second = engine.submit(request("deploy")).await.unwrap();
    let third = engine.submit(request("deploy")).await.unwrap();
    assert_eq!(third.status, Status::Queued);

    engine.waiter().resolve(&dispatched[0].1, NotifyResponse::success());
    wait_for_plan_status(&engine, first.id, Status::Succeeded).await;
    let dispatched = executor.wait_for_dispatches(2).await;
    assert_eq!(dispatched[1].0.plan_execution_id, second.id);

    let current = engine.store().get_plan_execution(third.id).await.unwrap().unwrap();
    assert_eq!(current.status, Status::Queued);

    engine.waiter().resolve(&dispatched[1].1, NotifyResponse::success());
    let dispatched = executor.wait_for_dispatches(3).await;
    assert_eq!(dispatched[2].0.plan_execution_id, third.id);
}
