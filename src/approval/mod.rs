//! Criteria-evaluated approvals
//!
//! An approval node is polled: each poll dispatches its task under a fresh
//! wait id, and the task output is checked against the approval criteria and
//! then the rejection criteria. An approval is finalized exactly once, by
//! whichever of "criteria matched" and "deadline passed" gets there first.

pub mod criteria;

pub use criteria::{
    ConditionOperator, CriteriaError, CriteriaEvaluator, CriteriaSpec, DefaultCriteriaEvaluator,
    KeyValueCondition,
};

use crate::core::NodeExecution;
use crate::execution::ExecutionEngine;
use crate::interrupt::IssuedBy;
use crate::timeout::{TimeoutCallback, TimeoutInstance, TimeoutTracker};
use crate::waiter::{NotifyCallback, NotifyResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Approval settings attached to a plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub approval_criteria: CriteriaSpec,

    #[serde(default)]
    pub rejection_criteria: Option<CriteriaSpec>,

    /// Delay between polls
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Overall deadline, measured from the start of the approval
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_retry_interval_secs() -> u64 {
    10
}

fn default_approval_timeout_secs() -> u64 {
    60 * 60 * 24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Waiting,
    Approved,
    Rejected,
    Expired,
}

/// Outcome of checking one task output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    /// Neither criteria matched; poll again
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub spec: ApprovalSpec,
    pub status: ApprovalStatus,
    pub deadline: DateTime<Utc>,

    /// Polls dispatched so far
    pub attempts: u32,

    #[serde(default)]
    pub last_output: Option<HashMap<String, String>>,

    #[serde(default)]
    pub deadline_timeout_id: Option<Uuid>,
}

impl ApprovalInstance {
    pub fn is_past_deadline(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

/// Tracks approval instances and evaluates their criteria
#[derive(Clone)]
pub struct ApprovalService {
    instances: Arc<DashMap<Uuid, ApprovalInstance>>,
    evaluator: Arc<dyn CriteriaEvaluator>,
}

impl ApprovalService {
    pub fn new(evaluator: Arc<dyn CriteriaEvaluator>) -> Self {
        Self {
            instances: Arc::new(DashMap::new()),
            evaluator,
        }
    }

    /// Start tracking an approval for `node`
    pub fn create(&self, node: &NodeExecution, spec: &ApprovalSpec) -> ApprovalInstance {
        let instance = ApprovalInstance {
            id: Uuid::new_v4(),
            node_execution_id: node.id,
            plan_execution_id: node.plan_execution_id,
            spec: spec.clone(),
            status: ApprovalStatus::Waiting,
            deadline: TimeoutTracker::after(Duration::from_secs(spec.timeout_secs)).deadline,
            attempts: 0,
            last_output: None,
            deadline_timeout_id: None,
        };
        self.instances.insert(instance.id, instance.clone());
        debug!(
            "Created approval {} for node execution {} (deadline {})",
            instance.id, node.id, instance.deadline
        );
        instance
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalInstance> {
        self.instances.get(&id).map(|entry| entry.clone())
    }

    /// Approvals belonging to a node execution
    pub fn for_node(&self, node_execution_id: Uuid) -> Vec<ApprovalInstance> {
        self.instances
            .iter()
            .filter(|entry| entry.node_execution_id == node_execution_id)
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn set_deadline_timeout(&self, id: Uuid, timeout_id: Uuid) {
        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.deadline_timeout_id = Some(timeout_id);
        }
    }

    /// Count a dispatched poll; returns the new attempt number
    pub fn record_attempt(&self, id: Uuid) -> u32 {
        match self.instances.get_mut(&id) {
            Some(mut entry) => {
                entry.attempts += 1;
                entry.attempts
            }
            None => 0,
        }
    }

    pub fn record_output(&self, id: Uuid, output: HashMap<String, String>) {
        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.last_output = Some(output);
        }
    }

    /// Move a waiting approval to a final status and stop tracking it.
    ///
    /// Returns the finalized instance, or `None` if it was already finalized.
    pub fn finalize(&self, id: Uuid, status: ApprovalStatus) -> Option<ApprovalInstance> {
        let (_, mut instance) = self.instances.remove(&id)?;
        instance.status = status;
        info!("Approval {} finalized as {:?}", id, status);
        Some(instance)
    }

    /// Drop every approval still tracked for a plan execution
    pub fn forget_plan(&self, plan_execution_id: Uuid) -> usize {
        let before = self.instances.len();
        self.instances
            .retain(|_, instance| instance.plan_execution_id != plan_execution_id);
        before.saturating_sub(self.instances.len())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Check an output against the approval criteria, then the rejection criteria.
    ///
    /// Evaluation errors count as "no match".
    pub fn evaluate(&self, spec: &ApprovalSpec, output: &HashMap<String, String>) -> ApprovalDecision {
        if self.matches(&spec.approval_criteria, output) {
            return ApprovalDecision::Approved;
        }
        match &spec.rejection_criteria {
            Some(rejection) if self.matches(rejection, output) => ApprovalDecision::Rejected,
            _ => ApprovalDecision::Pending,
        }
    }

    fn matches(&self, criteria: &CriteriaSpec, output: &HashMap<String, String>) -> bool {
        match self.evaluator.evaluate(criteria, output) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("Criteria evaluation failed, treating as no match: {}", e);
                false
            }
        }
    }
}

impl Default for ApprovalService {
    fn default() -> Self {
        Self::new(Arc::new(DefaultCriteriaEvaluator))
    }
}

/// Flatten a task response into the key-value map criteria are checked against.
///
/// An `output` entry holding an object (or a JSON string encoding one) is
/// used when present; otherwise the response map itself is flattened.
pub fn flatten_output(data: &Map<String, Value>) -> HashMap<String, String> {
    let nested = match data.get("output") {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    };

    nested
        .as_ref()
        .unwrap_or(data)
        .iter()
        .map(|(key, value)| (key.clone(), value_to_string(value)))
        .collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Receives the task output of one approval poll
pub struct ApprovalCallback {
    pub engine: ExecutionEngine,
    pub approval_id: Uuid,
}

#[async_trait]
impl NotifyCallback for ApprovalCallback {
    async fn notify(&self, response: NotifyResponse) {
        if let Err(e) = self.engine.handle_approval_response(self.approval_id, response).await {
            warn!("Failed to handle approval {} response: {}", self.approval_id, e);
        }
    }

    async fn notify_error(&self, response: NotifyResponse) {
        debug!(
            "Approval {} poll failed: {}",
            self.approval_id,
            response.error_message.as_deref().unwrap_or("unknown error")
        );
        if let Err(e) = self.engine.schedule_approval_poll(self.approval_id).await {
            warn!("Failed to reschedule approval {}: {}", self.approval_id, e);
        }
    }
}

/// Fires the next approval poll
pub struct ApprovalPollCallback {
    pub engine: ExecutionEngine,
    pub approval_id: Uuid,
}

#[async_trait]
impl TimeoutCallback for ApprovalPollCallback {
    async fn on_timeout(&self, _instance: TimeoutInstance) {
        if let Err(e) = self.engine.poll_approval(self.approval_id).await {
            warn!("Approval {} poll failed: {}", self.approval_id, e);
        }
    }
}

/// Expires an approval at its deadline
pub struct ApprovalExpiryCallback {
    pub engine: ExecutionEngine,
    pub approval_id: Uuid,
}

#[async_trait]
impl TimeoutCallback for ApprovalExpiryCallback {
    async fn on_timeout(&self, instance: TimeoutInstance) {
        let issued_by = IssuedBy::Timeout {
            timeout_id: instance.id,
        };
        if let Err(e) = self.engine.expire_approval(self.approval_id, issued_by).await {
            warn!("Failed to expire approval {}: {}", self.approval_id, e);
        }
    }
}
