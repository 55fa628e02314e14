//! Plan execution engine

pub mod admission;
pub mod engine;
pub mod executor;

pub use admission::{AccountTier, AdmissionConfig, AdmissionGovernor, StaticTierResolver, TierResolver};
pub use engine::{EngineWork, ExecutionEngine, ExecutionEngineBuilder, ExecutionEvent, ExecutionRequest};
pub use executor::{
    task_outcome, LoopbackTaskExecutor, ScriptedStepRunner, StepOutcome, StepRunner, TaskError, TaskExecutor,
    TaskHandle, TaskSpec,
};
