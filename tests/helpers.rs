//! Test utility functions for the orchestrator
#![allow(dead_code)]

use async_trait::async_trait;
use orchestrator::approval::ApprovalStatus;
use orchestrator::core::config::PlanConfig;
use orchestrator::core::{NodeExecution, Plan, PlanExecution, Status};
use orchestrator::execution::{
    ExecutionEngine, ExecutionEngineBuilder, ExecutionEvent, ExecutionRequest, TaskError, TaskExecutor,
    TaskHandle, TaskSpec,
};
use orchestrator::persistence::InMemoryExecutionStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

/// Task executor that records dispatches and never answers on its own.
/// Tests resolve the recorded wait ids through the engine's waiter.
#[derive(Clone, Default)]
pub struct RecordingTaskExecutor {
    dispatched: Arc<Mutex<Vec<(TaskSpec, String)>>>,
    reject: Arc<AtomicBool>,
}

impl RecordingTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following dispatch fail
    pub fn reject_dispatches(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<(TaskSpec, String)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Wait until at least `count` tasks have been dispatched
    pub async fn wait_for_dispatches(&self, count: usize) -> Vec<(TaskSpec, String)> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let dispatched = self.dispatched();
            if dispatched.len() >= count {
                return dispatched;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("Expected {} dispatches, saw {}", count, dispatched.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl TaskExecutor for RecordingTaskExecutor {
    async fn dispatch(&self, spec: TaskSpec, wait_id: &str) -> Result<TaskHandle, TaskError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TaskError::Unavailable("executor offline".to_string()));
        }
        self.dispatched.lock().unwrap().push((spec, wait_id.to_string()));
        Ok(TaskHandle {
            task_id: Uuid::new_v4().to_string(),
        })
    }
}

pub fn plan_from_yaml(yaml: &str) -> Plan {
    PlanConfig::from_yaml(yaml)
        .expect("Failed to parse plan YAML")
        .to_plan()
}

/// Build an engine over a fresh in-memory store and save the plan
pub async fn engine_with_plan(
    yaml: &str,
    configure: impl FnOnce(ExecutionEngineBuilder) -> ExecutionEngineBuilder,
) -> ExecutionEngine {
    let engine = configure(ExecutionEngine::builder(Arc::new(InMemoryExecutionStore::new()))).build();
    engine.save_plan(&plan_from_yaml(yaml)).await.unwrap();
    engine
}

pub fn request(plan_id: &str) -> ExecutionRequest {
    request_for(plan_id, "acc", "pipe")
}

pub fn request_for(plan_id: &str, account_id: &str, pipeline_id: &str) -> ExecutionRequest {
    ExecutionRequest {
        plan_id: plan_id.to_string(),
        account_id: account_id.to_string(),
        pipeline_id: pipeline_id.to_string(),
    }
}

/// Snapshot of a finished plan execution
#[derive(Debug, Clone)]
pub struct TestRun {
    pub execution: PlanExecution,
    pub nodes: Vec<NodeExecution>,
    pub events: Vec<ExecutionEvent>,
}

impl TestRun {
    pub fn status(&self) -> Status {
        self.execution.status
    }

    /// Executions of one setup id, oldest first
    pub fn nodes_for(&self, setup_id: &str) -> Vec<&NodeExecution> {
        let mut nodes: Vec<_> = self.nodes.iter().filter(|n| n.setup_id == setup_id).collect();
        nodes.sort_by_key(|n| n.attempt());
        nodes
    }

    /// Latest execution of a setup id
    pub fn node(&self, setup_id: &str) -> &NodeExecution {
        self.nodes_for(setup_id)
            .last()
            .copied()
            .unwrap_or_else(|| panic!("Node '{}' never ran", setup_id))
    }

    /// Setup ids in the order their executions were created
    pub fn execution_order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.setup_id.as_str()).collect()
    }

    pub fn advised_count(&self, node_execution_id: Uuid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::NodeAdvised { node_execution_id: id, .. } if *id == node_execution_id))
            .count()
    }

    /// Final status and poll count of every approval settled during the run
    pub fn approval_outcomes(&self) -> Vec<(ApprovalStatus, u32)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::ApprovalFinalized { status, attempts, .. } => Some((*status, *attempts)),
                _ => None,
            })
            .collect()
    }

    pub fn transitions_to(&self, status: Status) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::NodeStatusChanged { to, .. } if *to == status))
            .count()
    }

    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{}#{}={}", n.setup_id, n.attempt(), n.status))
            .collect();
        format!("plan {} [{}]", self.execution.status, nodes.join(", "))
    }
}

/// Submit a request and wait for the execution to finish
pub async fn run_to_completion(engine: &ExecutionEngine, request: ExecutionRequest) -> TestRun {
    let events = engine.subscribe();
    let execution = engine.submit(request).await.unwrap();
    finish(engine, execution.id, events).await
}

/// Wait for a submitted execution to finish and collect what happened
pub async fn finish(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    mut events: broadcast::Receiver<ExecutionEvent>,
) -> TestRun {
    let execution = engine
        .wait_for_completion(plan_execution_id, WAIT)
        .await
        .unwrap();
    // Work dispatched by the plan end (node teardown, admission) settles quickly
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.plan_execution_id() == plan_execution_id {
            collected.push(event);
        }
    }
    let nodes = engine.store().list_children(plan_execution_id).await.unwrap();

    TestRun {
        execution,
        nodes,
        events: collected,
    }
}

/// Poll the store until a node of `setup_id` satisfies `predicate`
pub async fn wait_for_node(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    setup_id: &str,
    predicate: impl Fn(&NodeExecution) -> bool,
) -> NodeExecution {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let nodes = engine.store().list_children(plan_execution_id).await.unwrap();
        if let Some(node) = nodes.into_iter().find(|n| n.setup_id == setup_id && predicate(n)) {
            return node;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Node '{}' never reached the expected state", setup_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_node_status(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    setup_id: &str,
    status: Status,
) -> NodeExecution {
    wait_for_node(engine, plan_execution_id, setup_id, |n| n.status == status).await
}

pub async fn wait_for_plan_status(engine: &ExecutionEngine, plan_execution_id: Uuid, status: Status) -> PlanExecution {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let execution = engine
            .store()
            .get_plan_execution(plan_execution_id)
            .await
            .unwrap()
            .unwrap();
        if execution.status == status {
            return execution;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Plan execution stayed {} instead of {}", execution.status, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert the plan finished with `status`
pub fn assert_plan_status(run: &TestRun, status: Status) {
    assert_eq!(run.status(), status, "unexpected plan outcome: {}", run.summary());
}

/// Assert the latest execution of a node ended with `status`
pub fn assert_node_ended(run: &TestRun, setup_id: &str, status: Status) {
    let node = run.node(setup_id);
    assert_eq!(node.status, status, "node '{}': {}", setup_id, run.summary());
    assert!(node.is_ended(), "node '{}' did not end: {}", setup_id, run.summary());
}

/// Every node of a finished plan has ended
pub fn assert_all_ended(run: &TestRun) {
    for node in &run.nodes {
        assert!(node.is_ended(), "node '{}' left open: {}", node.setup_id, run.summary());
    }
}
