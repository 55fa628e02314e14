//! Pure adviser resolution: final node status + obtainments -> one response

use crate::advise::{advisers, AdviserResponse};
use crate::core::{AdviserObtainment, EngineError, NodeExecution};
use std::time::Duration;
use tracing::debug;

/// Engine settings advisers may fall back on
#[derive(Debug, Clone)]
pub struct AdviseContext {
    /// Intervention timeout used when retries run out into manual intervention
    pub intervention_timeout: Duration,
}

impl Default for AdviseContext {
    fn default() -> Self {
        Self {
            intervention_timeout: Duration::from_secs(60 * 60 * 24),
        }
    }
}

/// Resolve the response for a node that reached a final status.
///
/// Every obtainment is decoded up front, so an unknown kind or malformed
/// parameters fail resolution even if an earlier adviser would apply.
/// The first adviser, in declaration order, that can advise on the node's
/// status produces the response.
pub fn resolve(
    node: &NodeExecution,
    obtainments: &[AdviserObtainment],
    ctx: &AdviseContext,
) -> Result<AdviserResponse, EngineError> {
    let advisers = obtainments
        .iter()
        .map(|obtainment| advisers::build(obtainment, ctx))
        .collect::<Result<Vec<_>, _>>()?;

    for (adviser, obtainment) in advisers.iter().zip(obtainments) {
        if adviser.can_advise(node.status) {
            let response = adviser.advise(node);
            debug!(
                "Adviser {} advised {} for node execution {} ({})",
                obtainment.kind,
                response.advise_type(),
                node.id,
                node.status
            );
            return Ok(response);
        }
    }

    // Nothing applied
    if node.status.is_positive() {
        Ok(AdviserResponse::NextStep {
            to_status: node.status,
            next_node_id: None,
        })
    } else {
        Ok(AdviserResponse::EndPlan { is_abort: true })
    }
}
