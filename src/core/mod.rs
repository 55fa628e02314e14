//! Core domain models
//!
//! This module defines the plan graph, the execution records created while
//! running it, and their configuration.

pub mod ambiance;
pub mod config;
pub mod error;
pub mod execution;
pub mod plan;
pub mod status;

pub use ambiance::*;
pub use error::EngineError;
pub use execution::*;
pub use plan::*;
pub use status::Status;
