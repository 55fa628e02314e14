//! orchestrator - a plan execution engine with advisers, interrupts,
//! timeouts and admission control

pub mod advise;
pub mod approval;
pub mod cli;
pub mod core;
pub mod execution;
pub mod interrupt;
pub mod persistence;
pub mod timeout;
pub mod waiter;

// Re-export commonly used types
pub use core::{Ambiance, EngineError, NodeExecution, Plan, PlanExecution, Status};
pub use core::config::{EngineConfig, PlanConfig};
pub use execution::{ExecutionEngine, ExecutionEvent, ExecutionRequest};
pub use interrupt::{Interrupt, InterruptType, IssuedBy};
pub use persistence::{ExecutionStore, InMemoryExecutionStore};
