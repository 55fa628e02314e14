//! Built-in adviser kinds
//!
//! Each kind decodes its own parameters from the obtainment and decides,
//! from a node's final status, whether it applies and what it responds.

use crate::advise::{AdviseContext, AdviserResponse, RepairActionCode};
use crate::core::{AdviserObtainment, EngineError, NodeExecution, Status};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

pub const ON_SUCCESS: &str = "ON_SUCCESS";
pub const ON_FAIL: &str = "ON_FAIL";
pub const RETRY: &str = "RETRY";
pub const MANUAL_INTERVENTION: &str = "MANUAL_INTERVENTION";
pub const IGNORE: &str = "IGNORE";
pub const MARK_SUCCESS: &str = "MARK_SUCCESS";
pub const ABORT: &str = "ABORT";
pub const END_PLAN: &str = "END_PLAN";

pub trait Adviser: Send + Sync {
    /// Whether this adviser reacts to a node that finished with `status`
    fn can_advise(&self, status: Status) -> bool;

    fn advise(&self, node: &NodeExecution) -> AdviserResponse;
}

/// Build the adviser named by an obtainment
pub fn build(obtainment: &AdviserObtainment, ctx: &AdviseContext) -> Result<Box<dyn Adviser>, EngineError> {
    let adviser: Box<dyn Adviser> = match obtainment.kind.trim().to_ascii_uppercase().as_str() {
        ON_SUCCESS => {
            let params: NextNodeParameters = decode(obtainment)?;
            Box::new(OnSuccessAdviser {
                next_node_id: params.next_node_id,
            })
        }
        ON_FAIL => {
            let params: NextNodeParameters = decode(obtainment)?;
            Box::new(OnFailAdviser {
                next_node_id: params.next_node_id,
            })
        }
        RETRY => {
            let params: RetryParameters = decode(obtainment)?;
            if params.after_retry == RepairActionCode::Retry {
                return Err(invalid(obtainment, "after_retry cannot be RETRY"));
            }
            Box::new(RetryAdviser {
                retry_count: params.retry_count,
                wait_intervals: params.wait_intervals,
                after_retry: params.after_retry,
                next_node_id: params.next_node_id,
                intervention_timeout: ctx.intervention_timeout,
            })
        }
        MANUAL_INTERVENTION => {
            let params: ManualInterventionParameters = decode(obtainment)?;
            if matches!(
                params.timeout_action,
                RepairActionCode::ManualIntervention | RepairActionCode::OnFail
            ) {
                return Err(invalid(
                    obtainment,
                    "timeout_action cannot be MANUAL_INTERVENTION or ON_FAIL",
                ));
            }
            Box::new(ManualInterventionAdviser {
                timeout: params
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.intervention_timeout),
                timeout_action: params.timeout_action,
            })
        }
        IGNORE => {
            let params: NextNodeParameters = decode(obtainment)?;
            Box::new(IgnoreAdviser {
                next_node_id: params.next_node_id,
            })
        }
        MARK_SUCCESS => {
            let params: NextNodeParameters = decode(obtainment)?;
            Box::new(MarkSuccessAdviser {
                next_node_id: params.next_node_id,
            })
        }
        ABORT => {
            let _: NoParameters = decode(obtainment)?;
            Box::new(AbortAdviser)
        }
        END_PLAN => {
            let _: NoParameters = decode(obtainment)?;
            Box::new(EndPlanAdviser)
        }
        _ => return Err(EngineError::UnknownAdviser(obtainment.kind.clone())),
    };
    Ok(adviser)
}

fn decode<T: DeserializeOwned>(obtainment: &AdviserObtainment) -> Result<T, EngineError> {
    let value = match &obtainment.parameters {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| invalid(obtainment, e.to_string()))
}

fn invalid(obtainment: &AdviserObtainment, message: impl Into<String>) -> EngineError {
    EngineError::InvalidAdviserParameters {
        kind: obtainment.kind.clone(),
        message: message.into(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParameters {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NextNodeParameters {
    #[serde(default)]
    next_node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryParameters {
    retry_count: usize,

    /// Seconds to wait before each attempt; the last entry repeats
    #[serde(default)]
    wait_intervals: Vec<u64>,

    #[serde(default = "default_after_retry")]
    after_retry: RepairActionCode,

    #[serde(default)]
    next_node_id: Option<String>,
}

fn default_after_retry() -> RepairActionCode {
    RepairActionCode::EndExecution
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManualInterventionParameters {
    #[serde(default)]
    timeout_secs: Option<u64>,

    #[serde(default = "default_after_retry")]
    timeout_action: RepairActionCode,
}

pub struct OnSuccessAdviser {
    next_node_id: Option<String>,
}

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_positive()
    }

    fn advise(&self, node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::NextStep {
            to_status: node.status,
            next_node_id: self.next_node_id.clone(),
        }
    }
}

/// Continues past a failure while keeping the failed status
pub struct OnFailAdviser {
    next_node_id: Option<String>,
}

impl Adviser for OnFailAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke()
    }

    fn advise(&self, node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::NextStep {
            to_status: node.status,
            next_node_id: self.next_node_id.clone(),
        }
    }
}

pub struct RetryAdviser {
    retry_count: usize,
    wait_intervals: Vec<u64>,
    after_retry: RepairActionCode,
    next_node_id: Option<String>,
    intervention_timeout: Duration,
}

impl RetryAdviser {
    fn wait_for_attempt(&self, attempt: usize) -> u64 {
        self.wait_intervals
            .get(attempt)
            .or_else(|| self.wait_intervals.last())
            .copied()
            .unwrap_or(0)
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke()
    }

    fn advise(&self, node: &NodeExecution) -> AdviserResponse {
        let attempt = node.attempt();
        if attempt < self.retry_count {
            return AdviserResponse::Retry {
                wait_interval_secs: self.wait_for_attempt(attempt),
                retry_node_execution_id: node.id,
            };
        }

        match self.after_retry {
            RepairActionCode::EndExecution | RepairActionCode::Retry => {
                AdviserResponse::EndPlan { is_abort: false }
            }
            RepairActionCode::Ignore => AdviserResponse::IgnoreFailure {
                next_node_id: self.next_node_id.clone(),
            },
            RepairActionCode::MarkAsSuccess => AdviserResponse::NextStep {
                to_status: Status::Succeeded,
                next_node_id: self.next_node_id.clone(),
            },
            RepairActionCode::ManualIntervention => AdviserResponse::InterventionWait {
                timeout: self.intervention_timeout,
                repair_action_code: RepairActionCode::EndExecution,
            },
            RepairActionCode::OnFail => AdviserResponse::NextStep {
                to_status: node.status,
                next_node_id: self.next_node_id.clone(),
            },
        }
    }
}

pub struct ManualInterventionAdviser {
    timeout: Duration,
    timeout_action: RepairActionCode,
}

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke() && status != Status::Expired
    }

    fn advise(&self, _node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::InterventionWait {
            timeout: self.timeout,
            repair_action_code: self.timeout_action,
        }
    }
}

pub struct IgnoreAdviser {
    next_node_id: Option<String>,
}

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke()
    }

    fn advise(&self, _node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::IgnoreFailure {
            next_node_id: self.next_node_id.clone(),
        }
    }
}

pub struct MarkSuccessAdviser {
    next_node_id: Option<String>,
}

impl Adviser for MarkSuccessAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke()
    }

    fn advise(&self, _node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::NextStep {
            to_status: Status::Succeeded,
            next_node_id: self.next_node_id.clone(),
        }
    }
}

pub struct AbortAdviser;

impl Adviser for AbortAdviser {
    fn can_advise(&self, status: Status) -> bool {
        status.is_broke()
    }

    fn advise(&self, _node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::EndPlan { is_abort: true }
    }
}

pub struct EndPlanAdviser;

impl Adviser for EndPlanAdviser {
    fn can_advise(&self, _status: Status) -> bool {
        true
    }

    fn advise(&self, _node: &NodeExecution) -> AdviserResponse {
        AdviserResponse::EndPlan { is_abort: false }
    }
}
