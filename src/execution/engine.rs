//! Main execution engine - drives plan executions node by node
//!
//! The engine never blocks on external events. Every step of follow-up work
//! (starting a node, advising it, applying an interrupt effect, admitting a
//! queued execution) is dispatched as its own task, and waiting nodes are
//! resumed by wait/notify listeners, timeouts or interrupts.

use crate::{
    advise::{resolve, AdviseContext, AdviseHandlers, AdviseType, RepairActionCode},
    approval::{
        flatten_output, ApprovalCallback, ApprovalDecision, ApprovalExpiryCallback, ApprovalInstance,
        ApprovalPollCallback, ApprovalService, ApprovalSpec, ApprovalStatus, CriteriaEvaluator, DefaultCriteriaEvaluator,
    },
    core::{
        config::EngineConfig, Ambiance, EngineError, FacilitatorKind, FailureInfo, Level, NodeBookkeeping,
        NodeExecution, Plan, PlanExecution, PlanNode, Status, ACCOUNT_ID, PIPELINE_ID,
    },
    execution::{
        admission::{AdmissionGovernor, StaticTierResolver, TierResolver},
        executor::{task_outcome, LoopbackTaskExecutor, ScriptedStepRunner, StepRunner, TaskExecutor, TaskSpec},
    },
    interrupt::{
        Interrupt, InterruptEffect, InterruptManager, InterruptState, InterruptType, IssuedBy, RegisterOutcome,
    },
    persistence::{finish_plan_execution, transition_node_status, transition_plan_status, ExecutionStore},
    timeout::{TimeoutCallback, TimeoutDimension, TimeoutInstance, TimeoutService, TimeoutTracker},
    waiter::{NotifyCallback, NotifyResponse, WaitNotifyEngine},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during plan execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PlanQueued {
        plan_execution_id: Uuid,
        pipeline_id: String,
    },
    PlanStarted {
        plan_execution_id: Uuid,
        plan_id: String,
    },
    NodeStarted {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        setup_id: String,
        attempt: usize,
    },
    NodeStatusChanged {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        from: Status,
        to: Status,
    },
    NodeAdvised {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        setup_id: String,
        status: Status,
        advise_type: AdviseType,
    },
    NodeRetryScheduled {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        retry_of: Uuid,
        setup_id: String,
        attempt: usize,
        wait_interval_secs: u64,
    },
    InterventionWaiting {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        setup_id: String,
        timeout_secs: u64,
        repair_action_code: RepairActionCode,
    },
    /// A status that observers may already have seen was rewritten
    StatusCorrected {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        from: Status,
        to: Status,
    },
    InterruptProcessed {
        plan_execution_id: Uuid,
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
        state: InterruptState,
    },
    ApprovalFinalized {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        approval_id: Uuid,
        status: ApprovalStatus,
        attempts: u32,
    },
    PlanCompleted {
        plan_execution_id: Uuid,
        status: Status,
    },
}

impl ExecutionEvent {
    pub fn plan_execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::PlanQueued { plan_execution_id, .. }
            | ExecutionEvent::PlanStarted { plan_execution_id, .. }
            | ExecutionEvent::NodeStarted { plan_execution_id, .. }
            | ExecutionEvent::NodeStatusChanged { plan_execution_id, .. }
            | ExecutionEvent::NodeAdvised { plan_execution_id, .. }
            | ExecutionEvent::NodeRetryScheduled { plan_execution_id, .. }
            | ExecutionEvent::InterventionWaiting { plan_execution_id, .. }
            | ExecutionEvent::StatusCorrected { plan_execution_id, .. }
            | ExecutionEvent::InterruptProcessed { plan_execution_id, .. }
            | ExecutionEvent::ApprovalFinalized { plan_execution_id, .. }
            | ExecutionEvent::PlanCompleted { plan_execution_id, .. } => *plan_execution_id,
        }
    }
}

/// Request to run a saved plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub plan_id: String,
    pub account_id: String,
    pub pipeline_id: String,
}

/// Unit of follow-up work, run on its own task
#[derive(Debug, Clone)]
pub enum EngineWork {
    StartPlan(Uuid),
    StartNode(Uuid),
    Advise(Uuid),
    ApplyEffect(InterruptEffect),
    AdmitQueued(String),
}

struct EngineInner {
    store: Arc<dyn ExecutionStore>,
    timeouts: TimeoutService,
    waiter: WaitNotifyEngine,
    interrupts: InterruptManager,
    approvals: ApprovalService,
    admission: AdmissionGovernor,
    handlers: AdviseHandlers,
    advise_context: AdviseContext,
    step_runner: Arc<dyn StepRunner>,
    task_executor: Arc<dyn TaskExecutor>,
    events: broadcast::Sender<ExecutionEvent>,
    config: EngineConfig,
}

/// Plan execution engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

pub struct ExecutionEngineBuilder {
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
    waiter: Option<WaitNotifyEngine>,
    step_runner: Option<Arc<dyn StepRunner>>,
    task_executor: Option<Arc<dyn TaskExecutor>>,
    tier_resolver: Option<Arc<dyn TierResolver>>,
    criteria_evaluator: Option<Arc<dyn CriteriaEvaluator>>,
}

impl ExecutionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a wait/notify engine with an external task executor
    pub fn waiter(mut self, waiter: WaitNotifyEngine) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = Some(runner);
        self
    }

    pub fn task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = Some(executor);
        self
    }

    pub fn tier_resolver(mut self, resolver: Arc<dyn TierResolver>) -> Self {
        self.tier_resolver = Some(resolver);
        self
    }

    pub fn criteria_evaluator(mut self, evaluator: Arc<dyn CriteriaEvaluator>) -> Self {
        self.criteria_evaluator = Some(evaluator);
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let config = self.config;
        let waiter = self.waiter.unwrap_or_default();
        let timeouts = TimeoutService::new();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let tier_resolver = self.tier_resolver.unwrap_or_else(|| {
            Arc::new(StaticTierResolver::new(
                config.account_tiers.clone(),
                config.default_tier,
            ))
        });
        let task_executor = self
            .task_executor
            .unwrap_or_else(|| Arc::new(LoopbackTaskExecutor::new(waiter.clone())));
        let evaluator = self
            .criteria_evaluator
            .unwrap_or_else(|| Arc::new(DefaultCriteriaEvaluator));

        let inner = EngineInner {
            interrupts: InterruptManager::new(self.store.clone(), timeouts.clone(), waiter.clone(), events.clone()),
            admission: AdmissionGovernor::new(config.admission.clone(), self.store.clone(), tier_resolver),
            approvals: ApprovalService::new(evaluator),
            handlers: AdviseHandlers::default(),
            advise_context: AdviseContext {
                intervention_timeout: Duration::from_secs(config.intervention_timeout_secs),
            },
            step_runner: self.step_runner.unwrap_or_else(|| Arc::new(ScriptedStepRunner::new())),
            task_executor,
            store: self.store,
            timeouts,
            waiter,
            events,
            config,
        };
        ExecutionEngine { inner: Arc::new(inner) }
    }
}

impl ExecutionEngine {
    pub fn builder(store: Arc<dyn ExecutionStore>) -> ExecutionEngineBuilder {
        ExecutionEngineBuilder {
            store,
            config: EngineConfig::default(),
            waiter: None,
            step_runner: None,
            task_executor: None,
            tier_resolver: None,
            criteria_evaluator: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn waiter(&self) -> &WaitNotifyEngine {
        &self.inner.waiter
    }

    pub fn timeouts(&self) -> &TimeoutService {
        &self.inner.timeouts
    }

    pub fn interrupts(&self) -> &InterruptManager {
        &self.inner.interrupts
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.inner.approvals
    }

    pub fn admission(&self) -> &AdmissionGovernor {
        &self.inner.admission
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Stop all pending timeouts
    pub fn shutdown(&self) {
        self.inner.timeouts.shutdown();
    }

    pub async fn save_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        self.inner.store.save_plan(plan).await?;
        Ok(())
    }

    /// Create a plan execution, starting it right away or queueing it
    /// according to admission control
    pub async fn submit(&self, request: ExecutionRequest) -> Result<PlanExecution, EngineError> {
        let plan = self
            .inner
            .store
            .get_plan(&request.plan_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(request.plan_id.clone()))?;

        let execution = {
            let _gate = self.inner.admission.admission_gate(&request.pipeline_id).await;
            let decision = self
                .inner
                .admission
                .should_queue(&request.account_id, &request.pipeline_id)
                .await;
            let status = if decision.should_queue {
                Status::Queued
            } else {
                Status::Running
            };
            let execution = PlanExecution::new(&plan.id, &request.pipeline_id, &request.account_id, status);
            self.inner.store.save_plan_execution(&execution).await?;
            execution
        };

        if execution.status == Status::Queued {
            info!(
                "Plan execution {} queued for pipeline {}",
                execution.id, execution.pipeline_id
            );
            self.emit(ExecutionEvent::PlanQueued {
                plan_execution_id: execution.id,
                pipeline_id: execution.pipeline_id.clone(),
            });
        } else {
            self.dispatch(EngineWork::StartPlan(execution.id));
        }
        Ok(execution)
    }

    /// Register an interrupt and apply it. Re-registering a known id returns
    /// that id without doing anything.
    pub async fn register_interrupt(&self, interrupt: Interrupt) -> Result<Uuid, EngineError> {
        let id = interrupt.id;
        if self.inner.interrupts.register(interrupt).await? == RegisterOutcome::Duplicate {
            return Ok(id);
        }
        let effect = self.inner.interrupts.process(id).await?;
        if effect != InterruptEffect::None {
            self.dispatch(EngineWork::ApplyEffect(effect));
        }
        Ok(id)
    }

    /// Wait until a plan execution reaches a final status
    pub async fn wait_for_completion(&self, id: Uuid, timeout: Duration) -> Result<PlanExecution, EngineError> {
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let execution = self
                .inner
                .store
                .get_plan_execution(id)
                .await?
                .ok_or(EngineError::PlanExecutionNotFound(id))?;
            if execution.status.is_final() {
                return Ok(execution);
            }

            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return Err(EngineError::WaitTimedOut(id)),
                    Ok(Ok(ExecutionEvent::PlanCompleted {
                        plan_execution_id, ..
                    })) if plan_execution_id == id => break,
                    Ok(Ok(_)) => {}
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        debug!("Event receiver lagged by {} events, re-reading", skipped);
                        break;
                    }
                    Ok(Err(RecvError::Closed)) => return Err(EngineError::WaitTimedOut(id)),
                }
            }
        }
    }

    /// Run follow-up work on its own task
    pub(crate) fn dispatch(&self, work: EngineWork) {
        let engine = self.clone();
        tokio::spawn(async move {
            let description = format!("{:?}", work);
            if let Err(e) = engine.run_work(work).await {
                error!("Engine work {} failed: {}", description, e);
            }
        });
    }

    async fn run_work(&self, work: EngineWork) -> Result<(), EngineError> {
        match work {
            EngineWork::StartPlan(id) => self.start_plan(id).await,
            EngineWork::StartNode(id) => self.start_node_execution(id).await,
            EngineWork::Advise(id) => self.advise_node(id).await,
            EngineWork::ApplyEffect(effect) => self.apply_effect(effect).await,
            EngineWork::AdmitQueued(pipeline_id) => self.admit_queued(&pipeline_id).await,
        }
    }

    async fn start_plan(&self, id: Uuid) -> Result<(), EngineError> {
        let execution = self.plan_execution(id).await?;
        if execution.status != Status::Running {
            debug!("Plan execution {} is {}, not starting", id, execution.status);
            return Ok(());
        }
        let plan = self.plan(&execution.plan_id).await?;

        info!("Starting plan execution {} of plan {}", id, plan.id);
        self.emit(ExecutionEvent::PlanStarted {
            plan_execution_id: id,
            plan_id: plan.id.clone(),
        });

        let ambiance = Ambiance::new(id, &plan.id)
            .with_setup_abstraction(ACCOUNT_ID, &execution.account_id)
            .with_setup_abstraction(PIPELINE_ID, &execution.pipeline_id);
        let Some(start) = plan.starting_node() else {
            let error = EngineError::NodeNotFound(plan.starting_node_id.clone());
            return self.fail_on_configuration(id, None, error).await;
        };
        let node = self.create_node_execution(&ambiance, start, None, Vec::new()).await?;
        self.dispatch(EngineWork::StartNode(node.id));
        Ok(())
    }

    /// Save a queued node execution for `plan_node`, one level below `base`
    pub(crate) async fn create_node_execution(
        &self,
        base: &Ambiance,
        plan_node: &PlanNode,
        parent_id: Option<Uuid>,
        retry_ids: Vec<Uuid>,
    ) -> Result<NodeExecution, EngineError> {
        let id = Uuid::new_v4();
        let level = Level::new(id, &plan_node.uuid, &plan_node.identifier, &plan_node.step_type);
        let node = NodeExecution::new(id, base.clone_for_child(level), &plan_node.uuid, parent_id, retry_ids);
        self.inner.store.save_node_execution(&node).await?;
        debug!("Created node execution {} for {}", id, plan_node.uuid);
        Ok(node)
    }

    async fn start_node_execution(&self, id: Uuid) -> Result<(), EngineError> {
        let node = self.node_execution(id).await?;
        let execution = self.plan_execution(node.plan_execution_id).await?;
        if execution.status.is_final() {
            transition_node_status(self.inner.store.as_ref(), id, |s| s == Status::Queued, Status::Aborted, true)
                .await?;
            debug!("Plan execution {} already ended, node {} not started", execution.id, id);
            return Ok(());
        }

        let plan = self.plan(&node.ambiance.plan_id).await?;
        let Some(plan_node) = plan.node(&node.setup_id).cloned() else {
            let error = EngineError::NodeNotFound(node.setup_id.clone());
            return self.fail_on_configuration(node.plan_execution_id, Some(id), error).await;
        };

        if !self
            .inner
            .store
            .update_node_status(id, Status::Queued, Status::Running)
            .await?
        {
            debug!("Node execution {} is no longer queued, not starting", id);
            return Ok(());
        }
        info!("Starting node {} (attempt {})", node.setup_id, node.attempt() + 1);
        self.emit(ExecutionEvent::NodeStarted {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: id,
            setup_id: node.setup_id.clone(),
            attempt: node.attempt(),
        });
        self.emit_status_change(&node, Status::Queued, Status::Running);

        if let Some(secs) = plan_node.timeout_secs {
            let callback = NodeTimeoutCallback {
                engine: self.clone(),
                plan_execution_id: node.plan_execution_id,
                node_execution_id: id,
            };
            let timeout_id = self.inner.timeouts.register_after(
                TimeoutDimension::NodeTimeout,
                Duration::from_secs(secs),
                Arc::new(callback),
            );
            self.inner
                .store
                .append_bookkeeping(id, NodeBookkeeping::TimeoutInstance(timeout_id))
                .await?;
        }

        if let Some(spec) = &plan_node.approval {
            return self.start_approval(&node, spec).await;
        }
        match plan_node.facilitator {
            FacilitatorKind::Sync => {
                let outcome = self.inner.step_runner.run(&plan_node, &node.ambiance).await;
                let status = if outcome.status.is_final() {
                    outcome.status
                } else {
                    warn!(
                        "Step {} returned non-final status {}, treating as ERRORED",
                        node.setup_id, outcome.status
                    );
                    Status::Errored
                };
                if let Some(message) = outcome.message {
                    self.inner
                        .store
                        .append_bookkeeping(id, NodeBookkeeping::FailureMessage(message))
                        .await?;
                }
                self.complete_node(id, Status::Running, status).await?;
            }
            FacilitatorKind::Async => self.start_task(&node, &plan_node, Status::AsyncWaiting).await?,
            FacilitatorKind::Task => self.start_task(&node, &plan_node, Status::TaskWaiting).await?,
            FacilitatorKind::Children => self.start_children(&node, &plan_node, &plan).await?,
        }
        Ok(())
    }

    async fn start_task(&self, node: &NodeExecution, plan_node: &PlanNode, waiting: Status) -> Result<(), EngineError> {
        let wait_id = Uuid::new_v4().to_string();
        self.inner
            .store
            .append_bookkeeping(node.id, NodeBookkeeping::WaitId(wait_id.clone()))
            .await?;
        let callback = ResumeNodeCallback {
            engine: self.clone(),
            node_execution_id: node.id,
            waiting,
        };
        self.inner.waiter.correlate(wait_id.clone(), Arc::new(callback));

        if !self
            .inner
            .store
            .update_node_status(node.id, Status::Running, waiting)
            .await?
        {
            self.inner.waiter.cancel(&wait_id);
            debug!("Node execution {} left RUNNING before its task was dispatched", node.id);
            return Ok(());
        }
        self.emit_status_change(node, Status::Running, waiting);

        match self
            .inner
            .task_executor
            .dispatch(task_spec(node, plan_node), &wait_id)
            .await
        {
            Ok(handle) => {
                debug!("Node {} dispatched as task {}", node.setup_id, handle.task_id);
            }
            Err(e) => {
                warn!("Dispatch of node {} failed: {}", node.setup_id, e);
                self.inner.waiter.cancel(&wait_id);
                self.inner
                    .store
                    .append_bookkeeping(node.id, NodeBookkeeping::FailureMessage(e.to_string()))
                    .await?;
                self.complete_node(node.id, waiting, Status::Failed).await?;
            }
        }
        Ok(())
    }

    async fn start_children(&self, node: &NodeExecution, plan_node: &PlanNode, plan: &Plan) -> Result<(), EngineError> {
        let mut children = Vec::with_capacity(plan_node.children.len());
        for child_id in &plan_node.children {
            let Some(child) = plan.node(child_id) else {
                let error = EngineError::NodeNotFound(child_id.clone());
                return self.fail_on_configuration(node.plan_execution_id, Some(node.id), error).await;
            };
            let child = self
                .create_node_execution(&node.ambiance, child, Some(node.id), Vec::new())
                .await?;
            children.push(child.id);
        }
        debug!("Node {} started {} children", node.setup_id, children.len());
        for child in children {
            self.dispatch(EngineWork::StartNode(child));
        }
        Ok(())
    }

    async fn complete_task(
        &self,
        node_execution_id: Uuid,
        waiting: Status,
        response: NotifyResponse,
    ) -> Result<(), EngineError> {
        let node = self.node_execution(node_execution_id).await?;
        if node.is_ended() || node.status != waiting {
            debug!(
                "Dropping task response for node execution {} in status {}",
                node_execution_id, node.status
            );
            return Ok(());
        }
        if let Some(message) = response.error_message.clone() {
            self.inner
                .store
                .append_bookkeeping(node_execution_id, NodeBookkeeping::FailureMessage(message))
                .await?;
        }
        self.complete_node(node_execution_id, waiting, task_outcome(&response))
            .await?;
        Ok(())
    }

    /// Move a node from `expected` to its outcome. Only the caller that wins
    /// the swap triggers adviser resolution; returns whether that was us.
    pub(crate) async fn complete_node(&self, id: Uuid, expected: Status, outcome: Status) -> Result<bool, EngineError> {
        if !self.inner.store.update_node_status(id, expected, outcome).await? {
            debug!(
                "Node execution {} was no longer {} when completing with {}",
                id, expected, outcome
            );
            return Ok(false);
        }
        let node = self.node_execution(id).await?;
        self.inner.timeouts.cancel_all(&node.timeout_instance_ids);
        info!("Node {} finished with {}", node.setup_id, outcome);
        self.emit_status_change(&node, expected, outcome);
        self.dispatch(EngineWork::Advise(id));
        Ok(true)
    }

    async fn advise_node(&self, id: Uuid) -> Result<(), EngineError> {
        let node = self.node_execution(id).await?;
        if node.is_ended() {
            debug!("Node execution {} already ended, not advising", id);
            return Ok(());
        }
        if !node.status.is_final() {
            debug!("Node execution {} is {}, nothing to advise", id, node.status);
            return Ok(());
        }

        let execution = self.plan_execution(node.plan_execution_id).await?;
        if execution.status.is_final() {
            self.inner
                .store
                .end_node_execution(id, node.status, node.status)
                .await?;
            return Ok(());
        }

        if let Some(parent_id) = node.parent_id {
            let parent = self.node_execution(parent_id).await?;
            if parent.is_ended() || parent.status.is_final() {
                debug!(
                    "Parent {} of node execution {} is already {}, dropping its outcome",
                    parent_id, id, parent.status
                );
                self.inner
                    .store
                    .end_node_execution(id, node.status, node.status)
                    .await?;
                return Ok(());
            }
        }

        let plan = self.plan(&node.ambiance.plan_id).await?;
        let Some(plan_node) = plan.node(&node.setup_id) else {
            let error = EngineError::NodeNotFound(node.setup_id.clone());
            return self.fail_on_configuration(node.plan_execution_id, Some(id), error).await;
        };

        let response = match resolve(&node, &plan_node.advisers, &self.inner.advise_context) {
            Ok(response) => response,
            Err(e) if e.is_configuration() => {
                return self.fail_on_configuration(node.plan_execution_id, Some(id), e).await;
            }
            Err(e) => return Err(e),
        };

        self.emit(ExecutionEvent::NodeAdvised {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: id,
            setup_id: node.setup_id.clone(),
            status: node.status,
            advise_type: response.advise_type(),
        });
        self.inner.handlers.handle(self, &node, response).await
    }

    /// The chain a node belongs to has no successor left
    pub(crate) async fn on_chain_end(&self, node_execution_id: Uuid) -> Result<(), EngineError> {
        let node = self.node_execution(node_execution_id).await?;
        match node.parent_id {
            Some(parent_id) => self.resume_parent(parent_id).await,
            None => {
                self.end_plan(node.plan_execution_id, node.status.plan_status(), Some(node.id), None)
                    .await?;
                Ok(())
            }
        }
    }

    /// Complete a `children` node once every current child has ended
    async fn resume_parent(&self, parent_id: Uuid) -> Result<(), EngineError> {
        let parent = self.node_execution(parent_id).await?;
        if parent.is_ended() || parent.status != Status::Running {
            return Ok(());
        }

        let children: Vec<_> = self
            .inner
            .store
            .list_children(parent.plan_execution_id)
            .await?
            .into_iter()
            .filter(|node| node.parent_id == Some(parent_id) && !node.old_retry)
            .collect();
        if children.iter().any(|child| !child.is_ended()) {
            return Ok(());
        }

        let status = children
            .iter()
            .find(|child| !child.status.is_positive())
            .map(|child| child.status)
            .unwrap_or(Status::Succeeded);
        debug!("All children of {} ended, completing with {}", parent.setup_id, status);
        self.complete_node(parent_id, Status::Running, status).await?;
        Ok(())
    }

    /// Close out a plan execution. Returns `false` if it had already ended.
    pub(crate) async fn end_plan(
        &self,
        plan_execution_id: Uuid,
        status: Status,
        culprit: Option<Uuid>,
        message: Option<String>,
    ) -> Result<bool, EngineError> {
        let failure = match culprit {
            Some(node_id) if status != Status::Succeeded => {
                self.inner.store.get_node_execution(node_id).await?.map(|node| {
                    let mut failure = FailureInfo::from_node(&node);
                    if message.is_some() {
                        failure.message = message.clone();
                    }
                    failure
                })
            }
            _ => None,
        };

        if !finish_plan_execution(self.inner.store.as_ref(), plan_execution_id, status, failure).await? {
            debug!("Plan execution {} already ended", plan_execution_id);
            return Ok(false);
        }
        match &message {
            Some(message) => info!("Plan execution {} finished with {}: {}", plan_execution_id, status, message),
            None => info!("Plan execution {} finished with {}", plan_execution_id, status),
        }

        self.inner.interrupts.discontinue_nodes(plan_execution_id).await?;
        self.plan_finished(plan_execution_id, status).await?;
        Ok(true)
    }

    async fn plan_finished(&self, plan_execution_id: Uuid, status: Status) -> Result<(), EngineError> {
        let dropped = self.inner.approvals.forget_plan(plan_execution_id);
        if dropped > 0 {
            debug!("Dropped {} unsettled approval(s) of plan execution {}", dropped, plan_execution_id);
        }
        self.emit(ExecutionEvent::PlanCompleted {
            plan_execution_id,
            status,
        });
        let execution = self.plan_execution(plan_execution_id).await?;
        self.dispatch(EngineWork::AdmitQueued(execution.pipeline_id));
        Ok(())
    }

    /// End the plan as FAILED because of a configuration error
    pub(crate) async fn fail_on_configuration(
        &self,
        plan_execution_id: Uuid,
        culprit: Option<Uuid>,
        error: EngineError,
    ) -> Result<(), EngineError> {
        error!("Configuration error in plan execution {}: {}", plan_execution_id, error);
        if let Some(node_id) = culprit {
            let node = self.node_execution(node_id).await?;
            if !node.is_ended() {
                self.inner.timeouts.cancel_all(&node.timeout_instance_ids);
                let status = if node.status.is_final() {
                    node.status
                } else {
                    Status::Failed
                };
                transition_node_status(self.inner.store.as_ref(), node_id, |s| s == node.status, status, true)
                    .await?;
            }
        }
        self.end_plan(plan_execution_id, Status::Failed, culprit, Some(error.to_string()))
            .await?;
        Ok(())
    }

    async fn apply_effect(&self, effect: InterruptEffect) -> Result<(), EngineError> {
        match effect {
            InterruptEffect::None => Ok(()),
            InterruptEffect::Readvise { node_execution_id } => self.advise_node(node_execution_id).await,
            InterruptEffect::Retry { node_execution_id } => {
                let node = self.node_execution(node_execution_id).await?;
                let response = crate::advise::AdviserResponse::Retry {
                    wait_interval_secs: 0,
                    retry_node_execution_id: node_execution_id,
                };
                self.inner.handlers.handle(self, &node, response).await
            }
            InterruptEffect::EndPlan {
                plan_execution_id,
                status,
                culprit,
            } => {
                self.end_plan(plan_execution_id, status, culprit, None).await?;
                Ok(())
            }
            InterruptEffect::PlanAborted {
                plan_execution_id,
                aborted_nodes,
            } => {
                info!(
                    "Plan execution {} aborted ({} node(s) discontinued)",
                    plan_execution_id, aborted_nodes
                );
                self.plan_finished(plan_execution_id, Status::Aborted).await
            }
        }
    }

    /// Start queued executions of a pipeline while admission allows it
    async fn admit_queued(&self, pipeline_id: &str) -> Result<(), EngineError> {
        let mut admitted = Vec::new();
        {
            let _gate = self.inner.admission.admission_gate(pipeline_id).await;
            for execution in self.inner.store.list_queued(pipeline_id).await? {
                let decision = self
                    .inner
                    .admission
                    .should_queue(&execution.account_id, pipeline_id)
                    .await;
                if decision.should_queue {
                    break;
                }
                let started = transition_plan_status(
                    self.inner.store.as_ref(),
                    execution.id,
                    |s| s == Status::Queued,
                    Status::Running,
                )
                .await?;
                if started.is_some() {
                    info!("Admitted queued plan execution {} for pipeline {}", execution.id, pipeline_id);
                    admitted.push(execution.id);
                }
            }
        }
        for id in admitted {
            self.dispatch(EngineWork::StartPlan(id));
        }
        Ok(())
    }

    pub(crate) async fn start_approval(&self, node: &NodeExecution, spec: &ApprovalSpec) -> Result<(), EngineError> {
        let instance = self.inner.approvals.create(node, spec);
        if !self
            .inner
            .store
            .update_node_status(node.id, Status::Running, Status::ApprovalWaiting)
            .await?
        {
            debug!("Node execution {} left RUNNING before its approval started", node.id);
            return Ok(());
        }
        self.emit_status_change(node, Status::Running, Status::ApprovalWaiting);

        let callback = ApprovalExpiryCallback {
            engine: self.clone(),
            approval_id: instance.id,
        };
        let timeout_id = self.inner.timeouts.register(
            TimeoutDimension::ApprovalDeadline,
            TimeoutTracker::at(instance.deadline),
            Arc::new(callback),
        );
        self.inner.approvals.set_deadline_timeout(instance.id, timeout_id);
        self.inner
            .store
            .append_bookkeeping(node.id, NodeBookkeeping::TimeoutInstance(timeout_id))
            .await?;

        self.poll_approval(instance.id).await
    }

    /// Dispatch one approval poll under a fresh wait id
    pub(crate) async fn poll_approval(&self, approval_id: Uuid) -> Result<(), EngineError> {
        let Some(instance) = self.inner.approvals.get(approval_id) else {
            return Ok(());
        };
        let node = self.node_execution(instance.node_execution_id).await?;
        if node.is_ended() || node.status != Status::ApprovalWaiting {
            return Ok(());
        }
        let plan = self.plan(&node.ambiance.plan_id).await?;
        let Some(plan_node) = plan.node(&node.setup_id) else {
            let error = EngineError::NodeNotFound(node.setup_id.clone());
            return self.fail_on_configuration(node.plan_execution_id, Some(node.id), error).await;
        };

        let wait_id = Uuid::new_v4().to_string();
        self.inner
            .store
            .append_bookkeeping(node.id, NodeBookkeeping::WaitId(wait_id.clone()))
            .await?;
        let callback = ApprovalCallback {
            engine: self.clone(),
            approval_id,
        };
        self.inner.waiter.correlate(wait_id.clone(), Arc::new(callback));
        let attempt = self.inner.approvals.record_attempt(approval_id);
        debug!("Polling approval {} (attempt {})", approval_id, attempt);

        if let Err(e) = self
            .inner
            .task_executor
            .dispatch(task_spec(&node, plan_node), &wait_id)
            .await
        {
            warn!("Approval {} poll could not be dispatched: {}", approval_id, e);
            self.inner.waiter.cancel(&wait_id);
            self.schedule_approval_poll(approval_id).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_approval_response(
        &self,
        approval_id: Uuid,
        response: NotifyResponse,
    ) -> Result<(), EngineError> {
        let Some(instance) = self.inner.approvals.get(approval_id) else {
            return Ok(());
        };

        let output = flatten_output(&response.data);
        let decision = self.inner.approvals.evaluate(&instance.spec, &output);
        self.inner.approvals.record_output(approval_id, output);

        let (approval_status, node_status) = match decision {
            ApprovalDecision::Approved => (ApprovalStatus::Approved, Status::Succeeded),
            ApprovalDecision::Rejected => (ApprovalStatus::Rejected, Status::ApprovalRejected),
            ApprovalDecision::Pending => return self.schedule_approval_poll(approval_id).await,
        };
        if let Some(finalized) = self.inner.approvals.finalize(approval_id, approval_status) {
            self.approval_finalized(&finalized);
            self.complete_node(finalized.node_execution_id, Status::ApprovalWaiting, node_status)
                .await?;
        }
        Ok(())
    }

    /// Schedule the next poll, or expire the approval if its deadline passed
    pub(crate) async fn schedule_approval_poll(&self, approval_id: Uuid) -> Result<(), EngineError> {
        let Some(instance) = self.inner.approvals.get(approval_id) else {
            return Ok(());
        };
        if instance.is_past_deadline() {
            let issued_by = IssuedBy::Timeout {
                timeout_id: instance.deadline_timeout_id.unwrap_or_else(Uuid::nil),
            };
            return self.expire_approval(approval_id, issued_by).await;
        }

        let callback = ApprovalPollCallback {
            engine: self.clone(),
            approval_id,
        };
        let timeout_id = self.inner.timeouts.register_after(
            TimeoutDimension::ApprovalPoll,
            Duration::from_secs(instance.spec.retry_interval_secs),
            Arc::new(callback),
        );
        self.inner
            .store
            .append_bookkeeping(instance.node_execution_id, NodeBookkeeping::TimeoutInstance(timeout_id))
            .await?;
        Ok(())
    }

    pub(crate) async fn expire_approval(&self, approval_id: Uuid, issued_by: IssuedBy) -> Result<(), EngineError> {
        let Some(instance) = self.inner.approvals.finalize(approval_id, ApprovalStatus::Expired) else {
            return Ok(());
        };
        self.approval_finalized(&instance);
        let interrupt = Interrupt::new(
            InterruptType::MarkExpired,
            instance.plan_execution_id,
            Some(instance.node_execution_id),
            issued_by,
        );
        match self.register_interrupt(interrupt).await {
            Ok(_) => Ok(()),
            Err(EngineError::Interrupt(e)) => {
                debug!("Approval {} expired without effect: {}", approval_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn approval_finalized(&self, instance: &ApprovalInstance) {
        self.emit(ExecutionEvent::ApprovalFinalized {
            plan_execution_id: instance.plan_execution_id,
            node_execution_id: instance.node_execution_id,
            approval_id: instance.id,
            status: instance.status,
            attempts: instance.attempts,
        });
    }

    pub(crate) async fn node_execution(&self, id: Uuid) -> Result<NodeExecution, EngineError> {
        self.inner
            .store
            .get_node_execution(id)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(id))
    }

    pub(crate) async fn plan_execution(&self, id: Uuid) -> Result<PlanExecution, EngineError> {
        self.inner
            .store
            .get_plan_execution(id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(id))
    }

    pub(crate) async fn plan(&self, plan_id: &str) -> Result<Plan, EngineError> {
        self.inner
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))
    }

    pub(crate) fn emit_status_change(&self, node: &NodeExecution, from: Status, to: Status) {
        self.emit(ExecutionEvent::NodeStatusChanged {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            from,
            to,
        });
    }
}

fn task_spec(node: &NodeExecution, plan_node: &PlanNode) -> TaskSpec {
    TaskSpec {
        node_execution_id: node.id,
        plan_execution_id: node.plan_execution_id,
        setup_id: node.setup_id.clone(),
        step_type: plan_node.step_type.clone(),
        parameters: plan_node.step_parameters.clone(),
    }
}

/// Resumes an `async`/`task` node when its task reports back
struct ResumeNodeCallback {
    engine: ExecutionEngine,
    node_execution_id: Uuid,
    waiting: Status,
}

#[async_trait]
impl NotifyCallback for ResumeNodeCallback {
    async fn notify(&self, response: NotifyResponse) {
        if let Err(e) = self
            .engine
            .complete_task(self.node_execution_id, self.waiting, response)
            .await
        {
            error!("Failed to resume node execution {}: {}", self.node_execution_id, e);
        }
    }

    async fn notify_error(&self, response: NotifyResponse) {
        self.notify(response).await;
    }
}

/// Expires a node that outlived its static timeout
struct NodeTimeoutCallback {
    engine: ExecutionEngine,
    plan_execution_id: Uuid,
    node_execution_id: Uuid,
}

#[async_trait]
impl TimeoutCallback for NodeTimeoutCallback {
    async fn on_timeout(&self, instance: TimeoutInstance) {
        let interrupt = Interrupt::new(
            InterruptType::MarkExpired,
            self.plan_execution_id,
            Some(self.node_execution_id),
            IssuedBy::Timeout {
                timeout_id: instance.id,
            },
        );
        if let Err(e) = self.engine.register_interrupt(interrupt).await {
            debug!("Timeout of node execution {} had no effect: {}", self.node_execution_id, e);
        }
    }
}
