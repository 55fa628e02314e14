//! Plan and engine configuration from YAML

use crate::approval::ApprovalSpec;
use crate::core::{AdviserObtainment, FacilitatorKind, Plan, PlanNode};
use crate::execution::admission::{AccountTier, AdmissionConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Top-level plan definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Setup id of the first node to run
    pub start: String,

    /// Plan nodes
    pub nodes: Vec<NodeConfig>,
}

/// Node definition as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Setup id, unique within the plan
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Opaque step type tag
    #[serde(default = "default_step_type")]
    pub step_type: String,

    #[serde(default)]
    pub facilitator: FacilitatorKind,

    /// Advisers evaluated in order once the node finishes
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,

    /// Static timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Child nodes for a `children` facilitator
    #[serde(default)]
    pub children: Vec<String>,

    /// Parameters passed through to the step
    #[serde(default)]
    pub parameters: serde_json::Value,

    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
}

fn default_step_type() -> String {
    "STEP".to_string()
}

impl PlanConfig {
    /// Load a plan definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a plan definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlanConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the structure of the plan graph.
    ///
    /// Adviser kinds are not checked here; an unknown kind fails the
    /// execution when the node is advised.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate node ID: {}", node.id);
            }
        }

        if !seen_ids.contains(self.start.as_str()) {
            anyhow::bail!("Start node '{}' does not exist", self.start);
        }

        for node in &self.nodes {
            for child in &node.children {
                if child == &node.id {
                    anyhow::bail!("Node '{}' lists itself as a child", node.id);
                }
                if !seen_ids.contains(child.as_str()) {
                    anyhow::bail!("Node '{}' references non-existent child '{}'", node.id, child);
                }
            }

            if node.facilitator == FacilitatorKind::Children && node.children.is_empty() {
                anyhow::bail!("Node '{}' uses the children facilitator but has no children", node.id);
            }

            if node.approval.is_some() && node.facilitator == FacilitatorKind::Children {
                anyhow::bail!("Node '{}' cannot be both an approval and a children node", node.id);
            }

            for adviser in &node.advisers {
                if let Some(next) = adviser.next_node_id() {
                    if !seen_ids.contains(next) {
                        anyhow::bail!(
                            "Node '{}' adviser {} references non-existent node '{}'",
                            node.id,
                            adviser.kind,
                            next
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert the definition into an immutable plan
    pub fn to_plan(&self) -> Plan {
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let plan_node = PlanNode {
                    uuid: node.id.clone(),
                    identifier: node.id.clone(),
                    name: node.name.clone().unwrap_or_else(|| node.id.clone()),
                    step_type: node.step_type.clone(),
                    facilitator: node.facilitator,
                    advisers: node.advisers.clone(),
                    timeout_secs: node.timeout_secs,
                    children: node.children.clone(),
                    step_parameters: node.parameters.clone(),
                    approval: node.approval.clone(),
                };
                (node.id.clone(), plan_node)
            })
            .collect();

        Plan {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            starting_node_id: self.start.clone(),
            nodes,
        }
    }
}

/// Engine-wide settings, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-tier concurrency ceilings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Tier used for accounts missing from `account_tiers`
    #[serde(default)]
    pub default_tier: Option<AccountTier>,

    /// Known account tiers
    #[serde(default)]
    pub account_tiers: HashMap<String, AccountTier>,

    /// Capacity of the execution event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Intervention timeout used when retries are exhausted into manual intervention
    #[serde(default = "default_intervention_timeout_secs")]
    pub intervention_timeout_secs: u64,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_intervention_timeout_secs() -> u64 {
    60 * 60 * 24
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            default_tier: Some(AccountTier::Free),
            account_tiers: HashMap::new(),
            event_capacity: default_event_capacity(),
            intervention_timeout_secs: default_intervention_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }
}
