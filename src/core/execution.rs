//! Run-time execution records

use crate::core::{Ambiance, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a plan execution did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Node execution whose outcome ended the plan
    pub node_execution_id: Uuid,

    pub setup_id: String,

    pub status: Status,

    /// Runtime ids of every attempt, oldest first, ending with the failing one
    pub retry_chain: Vec<Uuid>,

    #[serde(default)]
    pub message: Option<String>,
}

impl FailureInfo {
    pub fn from_node(node: &NodeExecution) -> Self {
        let mut retry_chain = node.retry_ids.clone();
        retry_chain.push(node.id);
        Self {
            node_execution_id: node.id,
            setup_id: node.setup_id.clone(),
            status: node.status,
            retry_chain,
            message: node.failure_message.clone(),
        }
    }
}

/// One run of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: String,

    /// Admission scope key
    pub pipeline_id: String,

    pub account_id: String,

    pub status: Status,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,

    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl PlanExecution {
    pub fn new(
        plan_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        account_id: impl Into<String>,
        status: Status,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            pipeline_id: pipeline_id.into(),
            account_id: account_id.into(),
            status,
            created_at: now,
            start_ts: (status == Status::Running).then_some(now),
            end_ts: None,
            failure: None,
        }
    }

    /// Duration of the run, if it has finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_ts? - self.start_ts?)
    }
}

/// One run-time instance of a plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Runtime id
    pub id: Uuid,

    pub plan_execution_id: Uuid,

    pub setup_id: String,

    /// Runtime id of the enclosing `children` node
    #[serde(default)]
    pub parent_id: Option<Uuid>,

    pub status: Status,

    pub ambiance: Ambiance,

    /// Earlier attempts this execution retries, oldest first
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,

    #[serde(default)]
    pub timeout_instance_ids: Vec<Uuid>,

    #[serde(default)]
    pub wait_ids: Vec<String>,

    /// Superseded by a newer retry attempt
    #[serde(default)]
    pub old_retry: bool,

    #[serde(default)]
    pub failure_message: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,

    /// Set once the node has been advised and closed out
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Create a queued node execution; `ambiance` must already carry this node's level
    pub fn new(
        id: Uuid,
        ambiance: Ambiance,
        setup_id: impl Into<String>,
        parent_id: Option<Uuid>,
        retry_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            setup_id: setup_id.into(),
            parent_id,
            status: Status::Queued,
            ambiance,
            retry_ids,
            timeout_instance_ids: Vec::new(),
            wait_ids: Vec::new(),
            old_retry: false,
            failure_message: None,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_ts.is_some()
    }

    /// Number of earlier attempts for this setup id
    pub fn attempt(&self) -> usize {
        self.retry_ids.len()
    }
}

/// Bookkeeping that may be appended to a node at any time, even after it ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeBookkeeping {
    TimeoutInstance(Uuid),
    WaitId(String),
    OldRetry,
    FailureMessage(String),
}

impl NodeBookkeeping {
    pub fn apply(&self, node: &mut NodeExecution) {
        match self {
            NodeBookkeeping::TimeoutInstance(id) => node.timeout_instance_ids.push(*id),
            NodeBookkeeping::WaitId(id) => node.wait_ids.push(id.clone()),
            NodeBookkeeping::OldRetry => node.old_retry = true,
            NodeBookkeeping::FailureMessage(message) => node.failure_message = Some(message.clone()),
        }
    }
}
