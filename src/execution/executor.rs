//! Executor seams: inline step runners and the external task executor

use crate::core::{Ambiance, PlanNode, Status};
use crate::waiter::{NotifyResponse, WaitNotifyEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Final status produced by running a step inline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: Status,
    pub message: Option<String>,
}

impl StepOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            message: Some(message.into()),
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self { status, message: None }
    }
}

/// Runs the unit of work of a `sync` node
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, node: &PlanNode, ambiance: &Ambiance) -> StepOutcome;
}

/// Work handed to the external task executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub setup_id: String,
    pub step_type: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task rejected: {0}")]
    Rejected(String),

    #[error("Task executor unavailable: {0}")]
    Unavailable(String),
}

/// External executor for `async`/`task` nodes. Completion is reported by
/// resolving `wait_id` on the wait/notify engine.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn dispatch(&self, spec: TaskSpec, wait_id: &str) -> Result<TaskHandle, TaskError>;
}

/// Step runner answering from a per-node script.
///
/// Each setup id has a queue of outcomes; the last one repeats. Unscripted
/// nodes succeed.
#[derive(Default)]
pub struct ScriptedStepRunner {
    outcomes: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
}

impl ScriptedStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcomes(mut self, setup_id: impl Into<String>, outcomes: Vec<StepOutcome>) -> Self {
        self.outcomes.get_mut().insert(setup_id.into(), outcomes.into());
        self
    }

    pub fn with_status(self, setup_id: impl Into<String>, status: Status) -> Self {
        self.with_outcomes(setup_id, vec![StepOutcome::with_status(status)])
    }
}

#[async_trait]
impl StepRunner for ScriptedStepRunner {
    async fn run(&self, node: &PlanNode, ambiance: &Ambiance) -> StepOutcome {
        let mut outcomes = self.outcomes.lock().await;
        let outcome = match outcomes.get_mut(&node.uuid) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(StepOutcome::succeeded);
        debug!(
            "Step {} (depth {}) finished with {}",
            node.identifier,
            ambiance.depth(),
            outcome.status
        );
        outcome
    }
}

/// Task executor that completes every task itself after a short delay.
///
/// Scripted per setup id: a final status and the output map to report.
#[derive(Clone)]
pub struct LoopbackTaskExecutor {
    waiter: WaitNotifyEngine,
    delay: Duration,
    statuses: Arc<HashMap<String, Status>>,
    outputs: Arc<HashMap<String, Map<String, Value>>>,
}

impl LoopbackTaskExecutor {
    pub fn new(waiter: WaitNotifyEngine) -> Self {
        Self {
            waiter,
            delay: Duration::from_millis(50),
            statuses: Arc::new(HashMap::new()),
            outputs: Arc::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_statuses(mut self, statuses: HashMap<String, Status>) -> Self {
        self.statuses = Arc::new(statuses);
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Map<String, Value>>) -> Self {
        self.outputs = Arc::new(outputs);
        self
    }

    fn response_for(&self, setup_id: &str) -> NotifyResponse {
        let status = self.statuses.get(setup_id).copied().unwrap_or(Status::Succeeded);
        let mut response = if status.is_positive() {
            NotifyResponse::success()
        } else {
            NotifyResponse::error(format!("Task {} reported {}", setup_id, status))
        };
        response.data = self.outputs.get(setup_id).cloned().unwrap_or_default();
        response.data.insert(TASK_STATUS_KEY.to_string(), Value::String(status.to_string()));
        response
    }
}

/// Response key a task may use to report a specific final status
pub const TASK_STATUS_KEY: &str = "status";

/// Final status carried by a task response: the reported status when it is
/// final, otherwise SUCCEEDED for a success and FAILED for an error.
pub fn task_outcome(response: &NotifyResponse) -> Status {
    let reported = response
        .data
        .get(TASK_STATUS_KEY)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Status>().ok())
        .filter(|status| status.is_final());
    match reported {
        Some(status) => status,
        None if response.success => Status::Succeeded,
        None => Status::Failed,
    }
}

#[async_trait]
impl TaskExecutor for LoopbackTaskExecutor {
    async fn dispatch(&self, spec: TaskSpec, wait_id: &str) -> Result<TaskHandle, TaskError> {
        let response = self.response_for(&spec.setup_id);
        let waiter = self.waiter.clone();
        let delay = self.delay;
        let wait_id = wait_id.to_string();
        info!("Dispatched task for {} under wait id {}", spec.setup_id, wait_id);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            waiter.resolve(&wait_id, response);
        });

        Ok(TaskHandle {
            task_id: Uuid::new_v4().to_string(),
        })
    }
}
