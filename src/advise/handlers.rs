//! Handlers that carry out an adviser's response

use crate::advise::{AdviserResponse, RepairActionCode};
use crate::core::{EngineError, NodeBookkeeping, NodeExecution, Status};
use crate::execution::{EngineWork, ExecutionEngine, ExecutionEvent};
use crate::interrupt::{Interrupt, InterruptError, InterruptType, IssuedBy};
use crate::persistence::transition_plan_status;
use crate::timeout::{TimeoutCallback, TimeoutDimension, TimeoutInstance};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dispatches each response variant to its handler
#[derive(Debug, Default)]
pub struct AdviseHandlers {
    next_step: NextStepHandler,
    retry: RetryHandler,
    intervention_wait: InterventionWaitHandler,
    end_plan: EndPlanHandler,
    ignore_failure: IgnoreFailureHandler,
}

impl AdviseHandlers {
    pub async fn handle(
        &self,
        engine: &ExecutionEngine,
        node: &NodeExecution,
        response: AdviserResponse,
    ) -> Result<(), EngineError> {
        match response {
            AdviserResponse::NextStep {
                to_status,
                next_node_id,
            } => {
                self.next_step
                    .handle(engine, node, to_status, next_node_id.as_deref())
                    .await
            }
            AdviserResponse::Retry {
                wait_interval_secs,
                retry_node_execution_id,
            } => {
                let node = if retry_node_execution_id == node.id {
                    node.clone()
                } else {
                    engine.node_execution(retry_node_execution_id).await?
                };
                self.retry.handle(engine, &node, wait_interval_secs).await
            }
            AdviserResponse::InterventionWait {
                timeout,
                repair_action_code,
            } => {
                self.intervention_wait
                    .handle(engine, node, timeout, repair_action_code)
                    .await
            }
            AdviserResponse::EndPlan { is_abort } => self.end_plan.handle(engine, node, is_abort).await,
            AdviserResponse::IgnoreFailure { next_node_id } => {
                self.ignore_failure
                    .handle(engine, node, next_node_id.as_deref(), &self.next_step)
                    .await
            }
        }
    }
}

/// Ends the node and moves on to its successor, or closes its chain
#[derive(Debug, Default)]
pub struct NextStepHandler;

impl NextStepHandler {
    pub async fn handle(
        &self,
        engine: &ExecutionEngine,
        node: &NodeExecution,
        to_status: Status,
        next_node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        // The successor exists before the node ends, so an observer never
        // sees a finished node with nothing after it
        let successor = match next_node_id {
            Some(next) => {
                let plan = engine.plan(&node.ambiance.plan_id).await?;
                let Some(plan_node) = plan.node(next) else {
                    let error = EngineError::NodeNotFound(next.to_string());
                    return engine
                        .fail_on_configuration(node.plan_execution_id, Some(node.id), error)
                        .await;
                };
                let base = node.ambiance.clone_for_finish();
                Some(
                    engine
                        .create_node_execution(&base, plan_node, node.parent_id, Vec::new())
                        .await?,
                )
            }
            None => None,
        };

        if !engine
            .store()
            .end_node_execution(node.id, node.status, to_status)
            .await?
        {
            return Err(conflict(engine, node, successor.as_ref()).await);
        }
        if to_status != node.status {
            engine.emit_status_change(node, node.status, to_status);
        }

        match successor {
            Some(successor) => {
                debug!("Node {} hands over to {}", node.setup_id, successor.setup_id);
                engine.dispatch(EngineWork::StartNode(successor.id));
                Ok(())
            }
            None => engine.on_chain_end(node.id).await,
        }
    }
}

/// Replaces the node with a fresh attempt of the same setup id
#[derive(Debug, Default)]
pub struct RetryHandler;

impl RetryHandler {
    pub async fn handle(
        &self,
        engine: &ExecutionEngine,
        node: &NodeExecution,
        wait_interval_secs: u64,
    ) -> Result<(), EngineError> {
        let plan = engine.plan(&node.ambiance.plan_id).await?;
        let Some(plan_node) = plan.node(&node.setup_id) else {
            let error = EngineError::NodeNotFound(node.setup_id.clone());
            return engine
                .fail_on_configuration(node.plan_execution_id, Some(node.id), error)
                .await;
        };

        let mut retry_ids = node.retry_ids.clone();
        retry_ids.push(node.id);
        let retried = engine
            .create_node_execution(&node.ambiance.clone_for_finish(), plan_node, node.parent_id, retry_ids)
            .await?;

        if !engine
            .store()
            .end_node_execution(node.id, node.status, node.status)
            .await?
        {
            return Err(conflict(engine, node, Some(&retried)).await);
        }
        engine
            .store()
            .append_bookkeeping(node.id, NodeBookkeeping::OldRetry)
            .await?;

        info!(
            "Retrying node {} (attempt {}) in {}s",
            node.setup_id,
            retried.attempt() + 1,
            wait_interval_secs
        );
        engine.emit(ExecutionEvent::NodeRetryScheduled {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: retried.id,
            retry_of: node.id,
            setup_id: node.setup_id.clone(),
            attempt: retried.attempt(),
            wait_interval_secs,
        });

        let callback = RetryDispatchCallback {
            engine: engine.clone(),
            node_execution_id: retried.id,
        };
        let timeout_id = engine.timeouts().register_after(
            TimeoutDimension::RetryWait,
            Duration::from_secs(wait_interval_secs),
            Arc::new(callback),
        );
        engine
            .store()
            .append_bookkeeping(retried.id, NodeBookkeeping::TimeoutInstance(timeout_id))
            .await?;
        Ok(())
    }
}

/// Parks the node and its plan until an operator or the timeout decides
#[derive(Debug, Default)]
pub struct InterventionWaitHandler;

impl InterventionWaitHandler {
    pub async fn handle(
        &self,
        engine: &ExecutionEngine,
        node: &NodeExecution,
        timeout: Duration,
        repair_action_code: RepairActionCode,
    ) -> Result<(), EngineError> {
        if !engine
            .store()
            .update_node_status(node.id, node.status, Status::InterventionWaiting)
            .await?
        {
            return Err(conflict(engine, node, None).await);
        }
        engine.emit_status_change(node, node.status, Status::InterventionWaiting);
        transition_plan_status(
            engine.store().as_ref(),
            node.plan_execution_id,
            |s| s == Status::Running,
            Status::InterventionWaiting,
        )
        .await?;

        warn!(
            "Node {} is waiting for intervention ({}s, then {:?})",
            node.setup_id,
            timeout.as_secs(),
            repair_action_code
        );
        engine.emit(ExecutionEvent::InterventionWaiting {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            setup_id: node.setup_id.clone(),
            timeout_secs: timeout.as_secs(),
            repair_action_code,
        });

        let callback = RepairActionCallback {
            engine: engine.clone(),
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            repair_action_code,
        };
        let timeout_id = engine
            .timeouts()
            .register_after(TimeoutDimension::InterventionWait, timeout, Arc::new(callback));
        engine
            .store()
            .append_bookkeeping(node.id, NodeBookkeeping::TimeoutInstance(timeout_id))
            .await?;
        Ok(())
    }
}

/// Ends the node, then the plan: directly, or through an ABORT_ALL
#[derive(Debug, Default)]
pub struct EndPlanHandler;

impl EndPlanHandler {
    pub async fn handle(&self, engine: &ExecutionEngine, node: &NodeExecution, is_abort: bool) -> Result<(), EngineError> {
        if !engine
            .store()
            .end_node_execution(node.id, node.status, node.status)
            .await?
        {
            return Err(conflict(engine, node, None).await);
        }

        if !is_abort {
            engine
                .end_plan(node.plan_execution_id, node.status.plan_status(), Some(node.id), None)
                .await?;
            return Ok(());
        }

        let interrupt = Interrupt::new(
            InterruptType::AbortAll,
            node.plan_execution_id,
            Some(node.id),
            IssuedBy::Adviser,
        );
        match engine.register_interrupt(interrupt).await {
            Ok(_) => Ok(()),
            Err(EngineError::Interrupt(InterruptError::PlanFinished { id, status })) => {
                debug!("Plan execution {} already ended with {}, nothing to abort", id, status);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Rewrites the failure as ignored, then continues like a next step
#[derive(Debug, Default)]
pub struct IgnoreFailureHandler;

impl IgnoreFailureHandler {
    pub async fn handle(
        &self,
        engine: &ExecutionEngine,
        node: &NodeExecution,
        next_node_id: Option<&str>,
        next_step: &NextStepHandler,
    ) -> Result<(), EngineError> {
        let interrupt = Interrupt::new(
            InterruptType::Ignore,
            node.plan_execution_id,
            Some(node.id),
            IssuedBy::Adviser,
        );
        engine.register_interrupt(interrupt).await?;

        let node = engine.node_execution(node.id).await?;
        next_step
            .handle(engine, &node, Status::IgnoreFailed, next_node_id)
            .await
    }
}

/// Abort a successor created ahead of time and build the conflict error
async fn conflict(engine: &ExecutionEngine, node: &NodeExecution, successor: Option<&NodeExecution>) -> EngineError {
    if let Some(successor) = successor {
        if let Err(e) = engine
            .store()
            .end_node_execution(successor.id, Status::Queued, Status::Aborted)
            .await
        {
            warn!("Could not abort unused node execution {}: {}", successor.id, e);
        }
    }
    let found = match engine.store().get_node_execution(node.id).await {
        Ok(Some(current)) => current.status,
        _ => node.status,
    };
    error!(
        "Node execution {} changed under the adviser (expected {}, found {})",
        node.id, node.status, found
    );
    EngineError::ConcurrentModification {
        id: node.id,
        expected: node.status,
        found,
    }
}

/// Interrupt applied when an intervention wait runs out
pub fn repair_interrupt(code: RepairActionCode) -> InterruptType {
    match code {
        RepairActionCode::MarkAsSuccess => InterruptType::MarkSuccess,
        RepairActionCode::Ignore => InterruptType::Ignore,
        RepairActionCode::Retry => InterruptType::Retry,
        RepairActionCode::EndExecution | RepairActionCode::ManualIntervention | RepairActionCode::OnFail => {
            InterruptType::MarkFailed
        }
    }
}

/// Starts a retried node once its wait interval has passed
struct RetryDispatchCallback {
    engine: ExecutionEngine,
    node_execution_id: Uuid,
}

#[async_trait]
impl TimeoutCallback for RetryDispatchCallback {
    async fn on_timeout(&self, _instance: TimeoutInstance) {
        self.engine.dispatch(EngineWork::StartNode(self.node_execution_id));
    }
}

/// Applies the repair action of an intervention wait that timed out
struct RepairActionCallback {
    engine: ExecutionEngine,
    plan_execution_id: Uuid,
    node_execution_id: Uuid,
    repair_action_code: RepairActionCode,
}

#[async_trait]
impl TimeoutCallback for RepairActionCallback {
    async fn on_timeout(&self, instance: TimeoutInstance) {
        let interrupt_type = repair_interrupt(self.repair_action_code);
        info!(
            "Intervention wait of node execution {} timed out, applying {}",
            self.node_execution_id, interrupt_type
        );
        let interrupt = Interrupt::new(
            interrupt_type,
            self.plan_execution_id,
            Some(self.node_execution_id),
            IssuedBy::Timeout {
                timeout_id: instance.id,
            },
        );
        if let Err(e) = self.engine.register_interrupt(interrupt).await {
            debug!(
                "Repair action for node execution {} had no effect: {}",
                self.node_execution_id, e
            );
        }
    }
}
