//! Persistence layer for plans and their executions
//!
//! Every status mutation goes through a compare-and-swap: the caller names
//! the status it expects to replace, and the store refuses the write (returning
//! `false`) when the stored status differs or the record has already ended.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{
    EngineError, FailureInfo, NodeBookkeeping, NodeExecution, Plan, PlanExecution, Status,
};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on re-read/re-decide rounds after a CAS conflict
const MAX_CAS_ATTEMPTS: usize = 8;

/// Storage for plans, plan executions and node executions
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Save (or replace) a plan
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>>;

    /// Save (or replace) a plan execution
    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<()>;

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>>;

    /// Move a non-final plan execution from `expected` to `new`
    async fn update_plan_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool>;

    /// Move a plan execution from `expected` to a final status and stamp its end time
    async fn end_plan_execution(
        &self,
        id: Uuid,
        expected: Status,
        status: Status,
        failure: Option<FailureInfo>,
    ) -> Result<bool>;

    /// Plan executions, newest first, optionally restricted to one pipeline
    async fn list_plan_executions(&self, pipeline_id: Option<&str>) -> Result<Vec<PlanExecution>>;

    /// Number of active (running or intervention-waiting) executions in a scope
    async fn find_running_count(&self, scope_key: &str) -> Result<usize>;

    /// Queued executions in a scope, oldest first
    async fn list_queued(&self, scope_key: &str) -> Result<Vec<PlanExecution>>;

    /// Save (or replace) a node execution
    async fn save_node_execution(&self, node: &NodeExecution) -> Result<()>;

    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>>;

    /// Move a node that has not ended from `expected` to `new`
    async fn update_node_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool>;

    /// Move a node from `expected` to a final status and close it out
    async fn end_node_execution(&self, id: Uuid, expected: Status, status: Status) -> Result<bool>;

    /// Append bookkeeping; allowed after the node has ended
    async fn append_bookkeeping(&self, id: Uuid, entry: NodeBookkeeping) -> Result<()>;

    /// All node executions of a plan execution, oldest first
    async fn list_children(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>>;
}

/// In-memory store (for testing or ephemeral use)
pub struct InMemoryExecutionStore {
    plans: RwLock<HashMap<String, Plan>>,
    plan_executions: RwLock<HashMap<Uuid, PlanExecution>>,
    node_executions: RwLock<HashMap<Uuid, NodeExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            plan_executions: RwLock::new(HashMap::new()),
            node_executions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.plans.write().await.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        Ok(self.plans.read().await.get(plan_id).cloned())
    }

    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<()> {
        self.plan_executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>> {
        Ok(self.plan_executions.read().await.get(&id).cloned())
    }

    async fn update_plan_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool> {
        let mut executions = self.plan_executions.write().await;
        let Some(execution) = executions.get_mut(&id) else {
            anyhow::bail!("Plan execution not found: {}", id);
        };
        if execution.status != expected || expected.is_final() {
            return Ok(false);
        }
        execution.status = new;
        if new == Status::Running && execution.start_ts.is_none() {
            execution.start_ts = Some(Utc::now());
        }
        Ok(true)
    }

    async fn end_plan_execution(
        &self,
        id: Uuid,
        expected: Status,
        status: Status,
        failure: Option<FailureInfo>,
    ) -> Result<bool> {
        if !status.is_final() {
            anyhow::bail!("Cannot end plan execution {} with non-final status {}", id, status);
        }
        let mut executions = self.plan_executions.write().await;
        let Some(execution) = executions.get_mut(&id) else {
            anyhow::bail!("Plan execution not found: {}", id);
        };
        if execution.status != expected || expected.is_final() {
            return Ok(false);
        }
        execution.status = status;
        execution.end_ts = Some(Utc::now());
        execution.failure = failure;
        Ok(true)
    }

    async fn list_plan_executions(&self, pipeline_id: Option<&str>) -> Result<Vec<PlanExecution>> {
        let executions = self.plan_executions.read().await;
        let mut result: Vec<_> = executions
            .values()
            .filter(|e| pipeline_id.map_or(true, |p| e.pipeline_id == p))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn find_running_count(&self, scope_key: &str) -> Result<usize> {
        let executions = self.plan_executions.read().await;
        Ok(executions
            .values()
            .filter(|e| e.pipeline_id == scope_key && e.status.is_active_plan())
            .count())
    }

    async fn list_queued(&self, scope_key: &str) -> Result<Vec<PlanExecution>> {
        let executions = self.plan_executions.read().await;
        let mut queued: Vec<_> = executions
            .values()
            .filter(|e| e.pipeline_id == scope_key && e.status == Status::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(queued)
    }

    async fn save_node_execution(&self, node: &NodeExecution) -> Result<()> {
        self.node_executions.write().await.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>> {
        Ok(self.node_executions.read().await.get(&id).cloned())
    }

    async fn update_node_status(&self, id: Uuid, expected: Status, new: Status) -> Result<bool> {
        let mut nodes = self.node_executions.write().await;
        let Some(node) = nodes.get_mut(&id) else {
            anyhow::bail!("Node execution not found: {}", id);
        };
        if node.is_ended() || node.status != expected {
            return Ok(false);
        }
        node.status = new;
        if new == Status::Running && node.start_ts.is_none() {
            node.start_ts = Some(Utc::now());
        }
        Ok(true)
    }

    async fn end_node_execution(&self, id: Uuid, expected: Status, status: Status) -> Result<bool> {
        if !status.is_final() {
            anyhow::bail!("Cannot end node execution {} with non-final status {}", id, status);
        }
        let mut nodes = self.node_executions.write().await;
        let Some(node) = nodes.get_mut(&id) else {
            anyhow::bail!("Node execution not found: {}", id);
        };
        if node.is_ended() || node.status != expected {
            return Ok(false);
        }
        node.status = status;
        node.end_ts = Some(Utc::now());
        Ok(true)
    }

    async fn append_bookkeeping(&self, id: Uuid, entry: NodeBookkeeping) -> Result<()> {
        let mut nodes = self.node_executions.write().await;
        let Some(node) = nodes.get_mut(&id) else {
            anyhow::bail!("Node execution not found: {}", id);
        };
        entry.apply(node);
        Ok(())
    }

    async fn list_children(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let nodes = self.node_executions.read().await;
        let mut children: Vec<_> = nodes
            .values()
            .filter(|n| n.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }
}

/// Move a node to `to` from whatever status it currently holds, as long as
/// `accept` allows that status.
///
/// Conflicting writers are handled by re-reading and re-deciding. Returns
/// the status that was replaced, or `None` when the transition no longer
/// applies (node ended, or its current status is not accepted).
pub async fn transition_node_status(
    store: &dyn ExecutionStore,
    id: Uuid,
    accept: impl Fn(Status) -> bool + Send + Sync,
    to: Status,
    end: bool,
) -> Result<Option<Status>, EngineError> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let node = store
            .get_node_execution(id)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(id))?;
        if node.is_ended() || !accept(node.status) {
            return Ok(None);
        }
        let swapped = if end {
            store.end_node_execution(id, node.status, to).await?
        } else {
            store.update_node_status(id, node.status, to).await?
        };
        if swapped {
            return Ok(Some(node.status));
        }
        debug!("Status of node execution {} changed underneath us, re-reading", id);
    }
    warn!("Giving up moving node execution {} to {} after repeated conflicts", id, to);
    Ok(None)
}

/// Plan-level counterpart of [`transition_node_status`] for non-final targets
pub async fn transition_plan_status(
    store: &dyn ExecutionStore,
    id: Uuid,
    accept: impl Fn(Status) -> bool + Send + Sync,
    to: Status,
) -> Result<Option<Status>, EngineError> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let execution = store
            .get_plan_execution(id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(id))?;
        if execution.status.is_final() || !accept(execution.status) {
            return Ok(None);
        }
        if store.update_plan_status(id, execution.status, to).await? {
            return Ok(Some(execution.status));
        }
        debug!("Status of plan execution {} changed underneath us, re-reading", id);
    }
    warn!("Giving up moving plan execution {} to {} after repeated conflicts", id, to);
    Ok(None)
}

/// Close out a plan execution with a final status, whatever its current
/// non-final status is. Returns `false` if it had already ended.
pub async fn finish_plan_execution(
    store: &dyn ExecutionStore,
    id: Uuid,
    status: Status,
    failure: Option<FailureInfo>,
) -> Result<bool, EngineError> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let execution = store
            .get_plan_execution(id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(id))?;
        if execution.status.is_final() {
            return Ok(false);
        }
        if store
            .end_plan_execution(id, execution.status, status, failure.clone())
            .await?
        {
            return Ok(true);
        }
        debug!("Status of plan execution {} changed underneath us, re-reading", id);
    }
    warn!("Giving up ending plan execution {} after repeated conflicts", id);
    Ok(false)
}
