//! Adviser resolution and the handlers for its responses
//!
//! When a node reaches a final status, its adviser obtainments are resolved
//! into exactly one [`AdviserResponse`], which is then consumed by the
//! matching handler.

pub mod advisers;
pub mod handlers;
pub mod resolver;

pub use handlers::AdviseHandlers;
pub use resolver::{resolve, AdviseContext};

use crate::core::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What to do after the configured response of an adviser has run out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    EndExecution,
    MarkAsSuccess,
    Retry,
    Ignore,
    ManualIntervention,
    OnFail,
}

/// Decision produced by adviser resolution. Consumed once, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum AdviserResponse {
    /// Close the node with `to_status` and start the successor, if any
    NextStep {
        to_status: Status,
        next_node_id: Option<String>,
    },
    /// Run the same setup id again after a delay
    Retry {
        wait_interval_secs: u64,
        retry_node_execution_id: Uuid,
    },
    /// Park the node until an operator acts or the timeout applies the repair action
    InterventionWait {
        timeout: Duration,
        repair_action_code: RepairActionCode,
    },
    EndPlan {
        is_abort: bool,
    },
    /// Rewrite the failure as ignored and continue
    IgnoreFailure {
        next_node_id: Option<String>,
    },
}

/// Tag of an [`AdviserResponse`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdviseType {
    NextStep,
    Retry,
    InterventionWait,
    EndPlan,
    IgnoreFailure,
}

impl AdviserResponse {
    pub fn advise_type(&self) -> AdviseType {
        match self {
            AdviserResponse::NextStep { .. } => AdviseType::NextStep,
            AdviserResponse::Retry { .. } => AdviseType::Retry,
            AdviserResponse::InterventionWait { .. } => AdviseType::InterventionWait,
            AdviserResponse::EndPlan { .. } => AdviseType::EndPlan,
            AdviserResponse::IgnoreFailure { .. } => AdviseType::IgnoreFailure,
        }
    }
}

impl fmt::Display for AdviseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdviseType::NextStep => "NEXT_STEP",
            AdviseType::Retry => "RETRY",
            AdviseType::InterventionWait => "INTERVENTION_WAIT",
            AdviseType::EndPlan => "END_PLAN",
            AdviseType::IgnoreFailure => "IGNORE_FAILURE",
        };
        f.write_str(name)
    }
}
