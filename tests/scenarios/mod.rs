//! Scenario-based tests for the orchestrator

mod abort_all;
mod admission;
mod approval;
mod failure_handling;
mod intervention_wait;
mod retry_behavior;
mod success_chain;
