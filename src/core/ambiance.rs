//! Ambiance: the nesting path of a node execution
//!
//! An ambiance is an ordered stack of levels, outermost first. The last
//! level always describes the node execution that owns the ambiance, which
//! lets a callback locate "the current node" without any other context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Setup abstraction key for the owning account
pub const ACCOUNT_ID: &str = "accountId";
/// Setup abstraction key for the pipeline identifier
pub const PIPELINE_ID: &str = "pipelineIdentifier";

/// One level of nesting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Runtime id of the node execution at this level
    pub runtime_id: Uuid,

    /// Setup id of the plan node at this level
    pub setup_id: String,

    /// Human-facing identifier of the plan node
    pub identifier: String,

    /// Step type tag of the plan node
    pub step_type: String,

    pub start_ts: DateTime<Utc>,
}

impl Level {
    pub fn new(
        runtime_id: Uuid,
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        Self {
            runtime_id,
            setup_id: setup_id.into(),
            identifier: identifier.into(),
            step_type: step_type.into(),
            start_ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    pub plan_id: String,

    /// Scoping values inherited by every level (account, pipeline, ...)
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,

    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_execution_id: Uuid, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.into(),
            setup_abstractions: HashMap::new(),
            levels: Vec::new(),
        }
    }

    /// Attach a setup abstraction
    pub fn with_setup_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID).map(String::as_str)
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.setup_abstractions.get(PIPELINE_ID).map(String::as_str)
    }

    /// Ambiance for a node nested one level below this one
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Ambiance with the current level removed
    pub fn clone_for_finish(&self) -> Self {
        let mut finished = self.clone();
        finished.levels.pop();
        finished
    }

    /// Ambiance keeping only the outermost `levels_to_keep` levels
    pub fn clone_with_levels(&self, levels_to_keep: usize) -> Self {
        let mut trimmed = self.clone();
        trimmed.levels.truncate(levels_to_keep);
        trimmed
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn obtain_current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|level| level.runtime_id)
    }

    pub fn obtain_current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|level| level.setup_id.as_str())
    }

    /// Runtime id of the enclosing node, if this ambiance is nested
    pub fn obtain_parent_runtime_id(&self) -> Option<Uuid> {
        if self.levels.len() < 2 {
            return None;
        }
        self.levels.get(self.levels.len() - 2).map(|level| level.runtime_id)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}
