//! Execution status model shared by plan and node executions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a plan execution or a node execution.
///
/// Plan executions only ever use `Queued`, `Running`, `InterventionWaiting`
/// and the final statuses; node executions use the whole set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Admitted but not yet started
    Queued,
    /// Currently executing
    Running,
    /// Waiting on an async external unit of work
    AsyncWaiting,
    /// Waiting on a task dispatched to an external executor
    TaskWaiting,
    /// Waiting for approval criteria to match
    ApprovalWaiting,
    /// Paused until an operator or a timeout resolves it
    InterventionWaiting,
    /// Being torn down by an abort
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Expired,
    Aborted,
    /// Failed, but the failure was ignored
    IgnoreFailed,
    /// Approval rejection criteria matched
    ApprovalRejected,
}

const ALL: [Status; 14] = [
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::ApprovalWaiting,
    Status::InterventionWaiting,
    Status::Discontinuing,
    Status::Succeeded,
    Status::Failed,
    Status::Errored,
    Status::Expired,
    Status::Aborted,
    Status::IgnoreFailed,
    Status::ApprovalRejected,
];

impl Status {
    /// Check if no further outcome can be produced from this status
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Errored
                | Status::Expired
                | Status::Aborted
                | Status::IgnoreFailed
                | Status::ApprovalRejected
        )
    }

    /// Statuses treated as success by advisers and plan completion
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::IgnoreFailed)
    }

    /// Failure outcomes that advisers may react to
    pub fn is_broke(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Expired | Status::ApprovalRejected
        )
    }

    /// Statuses in which a node is parked on an external event
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::ApprovalWaiting
                | Status::InterventionWaiting
        )
    }

    /// Plan statuses that count against an admission ceiling
    pub fn is_active_plan(self) -> bool {
        matches!(self, Status::Running | Status::InterventionWaiting)
    }

    /// Map a node's final status onto the status its plan ends with
    pub fn plan_status(self) -> Status {
        match self {
            s if s.is_positive() => Status::Succeeded,
            Status::Expired => Status::Expired,
            Status::Aborted | Status::Discontinuing => Status::Aborted,
            _ => Status::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ApprovalWaiting => "APPROVAL_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::IgnoreFailed => "IGNORE_FAILED",
            Status::ApprovalRejected => "APPROVAL_REJECTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        ALL.iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("Unknown status: {}", s))
    }
}
