//! Engine error types

use crate::core::Status;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while orchestrating a plan execution
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown adviser type: {0}")]
    UnknownAdviser(String),

    #[error("Invalid parameters for adviser {kind}: {message}")]
    InvalidAdviserParameters { kind: String, message: String },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan node not found: {0}")]
    NodeNotFound(String),

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(Uuid),

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    #[error("Node execution {id} was modified concurrently (expected {expected}, found {found})")]
    ConcurrentModification {
        id: Uuid,
        expected: Status,
        found: Status,
    },

    #[error("Plan execution {0} did not complete in time")]
    WaitTimedOut(Uuid),

    #[error(transparent)]
    Interrupt(#[from] crate::interrupt::InterruptError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Configuration errors end the plan execution as failed and are never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownAdviser(_)
                | EngineError::InvalidAdviserParameters { .. }
                | EngineError::NodeNotFound(_)
        )
    }
}
