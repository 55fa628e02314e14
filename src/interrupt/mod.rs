//! Interrupts: asynchronous control signals against a plan or one of its nodes
//!
//! Registration validates the target and records the interrupt under its
//! id; registering an id twice is a no-op. Processing applies the status
//! changes and returns an [`InterruptEffect`] describing the follow-up work
//! the engine still has to do.

use crate::core::{EngineError, FailureInfo, NodeBookkeeping, NodeExecution, Status};
use crate::execution::ExecutionEvent;
use crate::persistence::{finish_plan_execution, transition_node_status, transition_plan_status, ExecutionStore};
use crate::timeout::TimeoutService;
use crate::waiter::WaitNotifyEngine;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    AbortAll,
    Retry,
    Ignore,
    MarkSuccess,
    MarkFailed,
    MarkExpired,
}

impl InterruptType {
    /// Everything except `AbortAll` targets a single node
    pub fn is_node_scoped(self) -> bool {
        self != InterruptType::AbortAll
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Retry => "RETRY",
            InterruptType::Ignore => "IGNORE",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::MarkExpired => "MARK_EXPIRED",
        };
        f.write_str(name)
    }
}

/// Who raised an interrupt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    Operator { identity: String },
    Adviser,
    Timeout { timeout_id: Uuid },
}

impl fmt::Display for IssuedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuedBy::Operator { identity } => write!(f, "operator {}", identity),
            IssuedBy::Adviser => f.write_str("adviser"),
            IssuedBy::Timeout { timeout_id } => write!(f, "timeout {}", timeout_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,

    #[serde(default)]
    pub node_execution_id: Option<Uuid>,

    pub issued_by: IssuedBy,
    pub issue_time: DateTime<Utc>,
    pub state: InterruptState,

    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        issued_by: IssuedBy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            interrupt_type,
            plan_execution_id,
            node_execution_id,
            issued_by,
            issue_time: Utc::now(),
            state: InterruptState::Registered,
            failure_reason: None,
        }
    }

    /// Use a caller-supplied id, which makes re-submission idempotent
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("Interrupt {0} requires a node execution id")]
    MissingNode(InterruptType),

    #[error("Plan execution {0} not found")]
    PlanNotFound(Uuid),

    #[error("Plan execution {id} already finished as {status}")]
    PlanFinished { id: Uuid, status: Status },

    #[error("Node execution {node_execution_id} does not belong to plan execution {plan_execution_id}")]
    NodeMismatch {
        node_execution_id: Uuid,
        plan_execution_id: Uuid,
    },

    #[error("Interrupt {interrupt_type} cannot be applied to node execution {node_execution_id} in status {status}")]
    NodeNotInterruptible {
        node_execution_id: Uuid,
        interrupt_type: InterruptType,
        status: Status,
    },

    #[error("Interrupt {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// The id was already known; nothing was done
    Duplicate,
}

/// Follow-up work left to the engine once an interrupt has been processed
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptEffect {
    None,
    /// Run adviser resolution for the node's new status
    Readvise { node_execution_id: Uuid },
    /// Retry the node immediately
    Retry { node_execution_id: Uuid },
    /// End the plan, blaming `culprit`
    EndPlan {
        plan_execution_id: Uuid,
        status: Status,
        culprit: Option<Uuid>,
    },
    PlanAborted {
        plan_execution_id: Uuid,
        aborted_nodes: usize,
    },
}

pub struct InterruptManager {
    store: Arc<dyn ExecutionStore>,
    timeouts: TimeoutService,
    waiter: WaitNotifyEngine,
    events: broadcast::Sender<ExecutionEvent>,
    interrupts: DashMap<Uuid, Interrupt>,
}

impl InterruptManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        timeouts: TimeoutService,
        waiter: WaitNotifyEngine,
        events: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            store,
            timeouts,
            waiter,
            events,
            interrupts: DashMap::new(),
        }
    }

    /// Validate and record an interrupt
    pub async fn register(&self, interrupt: Interrupt) -> Result<RegisterOutcome, EngineError> {
        if self.interrupts.contains_key(&interrupt.id) {
            debug!("Interrupt {} already registered", interrupt.id);
            return Ok(RegisterOutcome::Duplicate);
        }

        let plan_execution = self
            .store
            .get_plan_execution(interrupt.plan_execution_id)
            .await?
            .ok_or(InterruptError::PlanNotFound(interrupt.plan_execution_id))?;
        if plan_execution.status.is_final() {
            return Err(InterruptError::PlanFinished {
                id: plan_execution.id,
                status: plan_execution.status,
            }
            .into());
        }

        match interrupt.node_execution_id {
            Some(node_execution_id) => {
                let node = self
                    .store
                    .get_node_execution(node_execution_id)
                    .await?
                    .ok_or(EngineError::NodeExecutionNotFound(node_execution_id))?;
                if node.plan_execution_id != interrupt.plan_execution_id {
                    return Err(InterruptError::NodeMismatch {
                        node_execution_id,
                        plan_execution_id: interrupt.plan_execution_id,
                    }
                    .into());
                }
            }
            None if interrupt.interrupt_type.is_node_scoped() => {
                return Err(InterruptError::MissingNode(interrupt.interrupt_type).into());
            }
            None => {}
        }

        match self.interrupts.entry(interrupt.id) {
            Entry::Occupied(_) => Ok(RegisterOutcome::Duplicate),
            Entry::Vacant(vacant) => {
                info!(
                    "Registered {} interrupt {} for plan execution {} (issued by {})",
                    interrupt.interrupt_type, interrupt.id, interrupt.plan_execution_id, interrupt.issued_by
                );
                vacant.insert(Interrupt {
                    state: InterruptState::Registered,
                    ..interrupt
                });
                Ok(RegisterOutcome::Registered)
            }
        }
    }

    /// Apply a registered interrupt. Processing an interrupt that is not in
    /// `Registered` state does nothing.
    pub async fn process(&self, id: Uuid) -> Result<InterruptEffect, EngineError> {
        let interrupt = {
            let mut entry = self.interrupts.get_mut(&id).ok_or(InterruptError::NotFound(id))?;
            if entry.state != InterruptState::Registered {
                return Ok(InterruptEffect::None);
            }
            entry.state = InterruptState::Processing;
            entry.clone()
        };

        let result = self.apply(&interrupt).await;

        let state = match &result {
            Ok(_) => InterruptState::Processed,
            Err(e) => {
                warn!("Interrupt {} ({}) failed: {}", id, interrupt.interrupt_type, e);
                InterruptState::Failed
            }
        };
        if let Some(mut entry) = self.interrupts.get_mut(&id) {
            entry.state = state;
            entry.failure_reason = result.as_ref().err().map(|e| e.to_string());
        }
        let _ = self.events.send(ExecutionEvent::InterruptProcessed {
            plan_execution_id: interrupt.plan_execution_id,
            interrupt_id: id,
            interrupt_type: interrupt.interrupt_type,
            state,
        });

        result
    }

    pub fn get(&self, id: Uuid) -> Option<Interrupt> {
        self.interrupts.get(&id).map(|entry| entry.clone())
    }

    /// Interrupts of a plan execution, oldest first
    pub fn list_for_plan(&self, plan_execution_id: Uuid) -> Vec<Interrupt> {
        let mut interrupts: Vec<_> = self
            .interrupts
            .iter()
            .filter(|entry| entry.plan_execution_id == plan_execution_id)
            .map(|entry| entry.clone())
            .collect();
        interrupts.sort_by(|a, b| a.issue_time.cmp(&b.issue_time));
        interrupts
    }

    /// Abort every node of a plan execution that has neither ended nor
    /// reached a final status. Each node goes DISCONTINUING -> ABORTED once;
    /// returns how many did.
    pub async fn discontinue_nodes(&self, plan_execution_id: Uuid) -> Result<usize, EngineError> {
        let nodes = self.store.list_children(plan_execution_id).await?;
        let mut aborted = 0;

        for node in nodes {
            if node.is_ended() || node.status.is_final() {
                continue;
            }
            if self.abort_node(plan_execution_id, node.id).await? {
                aborted += 1;
            }
        }

        if aborted > 0 {
            info!("Aborted {} node execution(s) of plan execution {}", aborted, plan_execution_id);
        }
        Ok(aborted)
    }

    /// Abort the live descendants of a node, walking `parent_id` links.
    /// Nodes already at a final status are left to their own advising.
    pub async fn discontinue_descendants(&self, plan_execution_id: Uuid, node_id: Uuid) -> Result<usize, EngineError> {
        let nodes = self.store.list_children(plan_execution_id).await?;
        let mut parents = vec![node_id];
        let mut aborted = 0;

        while let Some(parent_id) = parents.pop() {
            for node in nodes.iter().filter(|node| node.parent_id == Some(parent_id)) {
                parents.push(node.id);
                if node.is_ended() || node.status.is_final() {
                    continue;
                }
                if self.abort_node(plan_execution_id, node.id).await? {
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            info!("Aborted {} descendant(s) of node execution {}", aborted, node_id);
        }
        Ok(aborted)
    }

    /// DISCONTINUING -> release -> ABORTED for one node; `false` if the
    /// node was no longer live
    async fn abort_node(&self, plan_execution_id: Uuid, node_id: Uuid) -> Result<bool, EngineError> {
        let replaced = transition_node_status(
            self.store.as_ref(),
            node_id,
            |status| !status.is_final() && status != Status::Discontinuing,
            Status::Discontinuing,
            false,
        )
        .await?;
        let Some(from) = replaced else {
            return Ok(false);
        };
        self.emit_status_change(plan_execution_id, node_id, from, Status::Discontinuing);

        self.release_node(node_id).await?;
        if self
            .store
            .end_node_execution(node_id, Status::Discontinuing, Status::Aborted)
            .await?
        {
            self.emit_status_change(plan_execution_id, node_id, Status::Discontinuing, Status::Aborted);
            Ok(true)
        } else {
            warn!("Node execution {} left DISCONTINUING unexpectedly", node_id);
            Ok(false)
        }
    }

    async fn apply(&self, interrupt: &Interrupt) -> Result<InterruptEffect, EngineError> {
        let target = || {
            interrupt
                .node_execution_id
                .ok_or(InterruptError::MissingNode(interrupt.interrupt_type))
        };

        match interrupt.interrupt_type {
            InterruptType::AbortAll => self.abort_all(interrupt).await,
            InterruptType::MarkExpired => {
                let node_id = target()?;
                self.transition(interrupt, node_id, |s| s == Status::Running || s.is_waiting(), Status::Expired, false)
                    .await?;
                self.record_reason(interrupt, node_id).await?;
                self.release_subtree(interrupt, node_id).await?;
                self.resume_plan(interrupt.plan_execution_id).await?;
                Ok(InterruptEffect::Readvise {
                    node_execution_id: node_id,
                })
            }
            InterruptType::MarkSuccess => {
                let node_id = target()?;
                self.transition(interrupt, node_id, |s| s.is_waiting() || s.is_broke(), Status::Succeeded, false)
                    .await?;
                self.release_subtree(interrupt, node_id).await?;
                self.resume_plan(interrupt.plan_execution_id).await?;
                Ok(InterruptEffect::Readvise {
                    node_execution_id: node_id,
                })
            }
            InterruptType::MarkFailed => {
                let node_id = target()?;
                self.transition(interrupt, node_id, |_| true, Status::Failed, true)
                    .await?;
                self.record_reason(interrupt, node_id).await?;
                self.release_subtree(interrupt, node_id).await?;
                Ok(InterruptEffect::EndPlan {
                    plan_execution_id: interrupt.plan_execution_id,
                    status: Status::Failed,
                    culprit: Some(node_id),
                })
            }
            InterruptType::Ignore => {
                let node_id = target()?;
                let from = self
                    .transition(
                        interrupt,
                        node_id,
                        |s| s.is_broke() || s == Status::InterventionWaiting,
                        Status::IgnoreFailed,
                        false,
                    )
                    .await?;
                let _ = self.events.send(ExecutionEvent::StatusCorrected {
                    plan_execution_id: interrupt.plan_execution_id,
                    node_execution_id: node_id,
                    from,
                    to: Status::IgnoreFailed,
                });
                self.release_subtree(interrupt, node_id).await?;
                self.resume_plan(interrupt.plan_execution_id).await?;
                if interrupt.issued_by == IssuedBy::Adviser {
                    Ok(InterruptEffect::None)
                } else {
                    Ok(InterruptEffect::Readvise {
                        node_execution_id: node_id,
                    })
                }
            }
            InterruptType::Retry => {
                let node_id = target()?;
                let node = self.node(node_id).await?;
                if node.is_ended() || !(node.status.is_broke() || node.status == Status::InterventionWaiting) {
                    return Err(not_interruptible(interrupt, &node));
                }
                if node.status == Status::InterventionWaiting {
                    self.transition(interrupt, node_id, |s| s == Status::InterventionWaiting, Status::Failed, false)
                        .await?;
                }
                self.release_subtree(interrupt, node_id).await?;
                self.resume_plan(interrupt.plan_execution_id).await?;
                Ok(InterruptEffect::Retry {
                    node_execution_id: node_id,
                })
            }
        }
    }

    async fn abort_all(&self, interrupt: &Interrupt) -> Result<InterruptEffect, EngineError> {
        let plan_execution_id = interrupt.plan_execution_id;
        let failure = match interrupt.node_execution_id {
            Some(node_id) => self.store.get_node_execution(node_id).await?.map(|node| {
                let mut failure = FailureInfo::from_node(&node);
                if failure.message.is_none() {
                    failure.message = Some(format!("Aborted by {}", interrupt.issued_by));
                }
                failure
            }),
            None => None,
        };

        if !finish_plan_execution(self.store.as_ref(), plan_execution_id, Status::Aborted, failure).await? {
            let status = self
                .store
                .get_plan_execution(plan_execution_id)
                .await?
                .map(|execution| execution.status)
                .ok_or(InterruptError::PlanNotFound(plan_execution_id))?;
            return Err(InterruptError::PlanFinished {
                id: plan_execution_id,
                status,
            }
            .into());
        }
        info!("Plan execution {} aborted by {}", plan_execution_id, interrupt.issued_by);

        let aborted_nodes = self.discontinue_nodes(plan_execution_id).await?;
        Ok(InterruptEffect::PlanAborted {
            plan_execution_id,
            aborted_nodes,
        })
    }

    /// Move the node to `to` if its current status is accepted, returning the
    /// status it replaced
    async fn transition(
        &self,
        interrupt: &Interrupt,
        node_id: Uuid,
        accept: impl Fn(Status) -> bool + Send + Sync,
        to: Status,
        end: bool,
    ) -> Result<Status, EngineError> {
        match transition_node_status(self.store.as_ref(), node_id, accept, to, end).await? {
            Some(from) => {
                self.emit_status_change(interrupt.plan_execution_id, node_id, from, to);
                Ok(from)
            }
            None => {
                let node = self.node(node_id).await?;
                Err(not_interruptible(interrupt, &node))
            }
        }
    }

    async fn node(&self, id: Uuid) -> Result<NodeExecution, EngineError> {
        self.store
            .get_node_execution(id)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(id))
    }

    async fn record_reason(&self, interrupt: &Interrupt, node_id: Uuid) -> Result<(), EngineError> {
        let message = format!("{} issued by {}", interrupt.interrupt_type, interrupt.issued_by);
        self.store
            .append_bookkeeping(node_id, NodeBookkeeping::FailureMessage(message))
            .await?;
        Ok(())
    }

    /// Cancel the node's pending timeouts and wait correlations
    async fn release_node(&self, node_id: Uuid) -> Result<(), EngineError> {
        let node = self.node(node_id).await?;
        let timeouts = self.timeouts.cancel_all(&node.timeout_instance_ids);
        let waits = node
            .wait_ids
            .iter()
            .filter(|wait_id| self.waiter.cancel(wait_id))
            .count();
        if timeouts + waits > 0 {
            debug!(
                "Released node execution {}: {} timeout(s), {} wait(s)",
                node_id, timeouts, waits
            );
        }
        Ok(())
    }

    /// Release a node settled by an interrupt. Its live descendants belong
    /// to a decision that has been taken, so they are aborted.
    async fn release_subtree(&self, interrupt: &Interrupt, node_id: Uuid) -> Result<(), EngineError> {
        self.release_node(node_id).await?;
        self.discontinue_descendants(interrupt.plan_execution_id, node_id).await?;
        Ok(())
    }

    /// Put the plan back to RUNNING once no node is waiting for intervention
    async fn resume_plan(&self, plan_execution_id: Uuid) -> Result<(), EngineError> {
        let nodes = self.store.list_children(plan_execution_id).await?;
        if nodes
            .iter()
            .any(|node| !node.is_ended() && node.status == Status::InterventionWaiting)
        {
            return Ok(());
        }
        let resumed = transition_plan_status(
            self.store.as_ref(),
            plan_execution_id,
            |status| status == Status::InterventionWaiting,
            Status::Running,
        )
        .await?;
        if resumed.is_some() {
            info!("Plan execution {} resumed from intervention", plan_execution_id);
        }
        Ok(())
    }

    fn emit_status_change(&self, plan_execution_id: Uuid, node_execution_id: Uuid, from: Status, to: Status) {
        let _ = self.events.send(ExecutionEvent::NodeStatusChanged {
            plan_execution_id,
            node_execution_id,
            from,
            to,
        });
    }
}

fn not_interruptible(interrupt: &Interrupt, node: &NodeExecution) -> EngineError {
    InterruptError::NodeNotInterruptible {
        node_execution_id: node.id,
        interrupt_type: interrupt.interrupt_type,
        status: node.status,
    }
    .into()
}
