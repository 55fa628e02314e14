//! Static plan graph

use crate::approval::ApprovalSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a node's unit of work is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacilitatorKind {
    /// Executed inline; produces a final status immediately
    #[default]
    Sync,
    /// Dispatched to the task executor, resumed through the waiter
    Async,
    /// Like `Async`, but reported as a delegate task
    Task,
    /// Starts its child nodes and completes when they have all ended
    Children,
}

/// A declared adviser: kind plus opaque parameters.
///
/// The kind is kept as a string so that an unknown kind surfaces as a
/// configuration error at resolution time rather than at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl AdviserObtainment {
    pub fn new(kind: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }

    /// Successor referenced by the parameters, if any
    pub fn next_node_id(&self) -> Option<&str> {
        self.parameters.get("next_node_id").and_then(|v| v.as_str())
    }
}

/// One node of the plan graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Setup id, unique within the plan
    pub uuid: String,

    pub identifier: String,

    pub name: String,

    /// Opaque step type tag
    pub step_type: String,

    pub facilitator: FacilitatorKind,

    /// Advisers evaluated in order after the node finishes
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,

    /// Static timeout, after which the node expires
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Setup ids started by a `children` facilitator
    #[serde(default)]
    pub children: Vec<String>,

    /// Opaque parameters handed to the step runner or task executor
    #[serde(default)]
    pub step_parameters: serde_json::Value,

    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub starting_node_id: String,
    pub nodes: HashMap<String, PlanNode>,
}

impl Plan {
    pub fn node(&self, setup_id: &str) -> Option<&PlanNode> {
        self.nodes.get(setup_id)
    }

    pub fn starting_node(&self) -> Option<&PlanNode> {
        self.node(&self.starting_node_id)
    }
}
