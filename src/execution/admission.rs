//! Admission control: run now or queue, per pipeline and account tier

use crate::persistence::ExecutionStore;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountTier {
    Free,
    Team,
    Enterprise,
}

/// Concurrent execution ceilings per pipeline, by account tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_free_ceiling")]
    pub free: usize,

    #[serde(default = "default_team_ceiling")]
    pub team: usize,

    #[serde(default = "default_enterprise_ceiling")]
    pub enterprise: usize,
}

fn default_free_ceiling() -> usize {
    2
}

fn default_team_ceiling() -> usize {
    20
}

fn default_enterprise_ceiling() -> usize {
    100
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            free: default_free_ceiling(),
            team: default_team_ceiling(),
            enterprise: default_enterprise_ceiling(),
        }
    }
}

impl AdmissionConfig {
    pub fn ceiling(&self, tier: AccountTier) -> usize {
        match tier {
            AccountTier::Free => self.free,
            AccountTier::Team => self.team,
            AccountTier::Enterprise => self.enterprise,
        }
    }
}

/// Looks up the license tier of an account
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve_tier(&self, account_id: &str) -> anyhow::Result<AccountTier>;
}

/// Tier lookup backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticTierResolver {
    tiers: HashMap<String, AccountTier>,
    default_tier: Option<AccountTier>,
}

impl StaticTierResolver {
    pub fn new(tiers: HashMap<String, AccountTier>, default_tier: Option<AccountTier>) -> Self {
        Self { tiers, default_tier }
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn resolve_tier(&self, account_id: &str) -> anyhow::Result<AccountTier> {
        self.tiers
            .get(account_id)
            .copied()
            .or(self.default_tier)
            .ok_or_else(|| anyhow::anyhow!("No tier known for account {}", account_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShouldQueueResponse {
    pub should_queue: bool,
}

pub struct AdmissionGovernor {
    config: AdmissionConfig,
    store: Arc<dyn ExecutionStore>,
    tiers: Arc<dyn TierResolver>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl AdmissionGovernor {
    pub fn new(config: AdmissionConfig, store: Arc<dyn ExecutionStore>, tiers: Arc<dyn TierResolver>) -> Self {
        Self {
            config,
            store,
            tiers,
            gates: DashMap::new(),
        }
    }

    /// Serialize admission decisions for one pipeline. Hold the guard until
    /// the decision has been persisted.
    pub async fn admission_gate(&self, pipeline_id: &str) -> OwnedMutexGuard<()> {
        let gate = self
            .gates
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        gate.lock_owned().await
    }

    /// Decide whether a new execution must wait. Lookup failures admit the
    /// execution.
    pub async fn should_queue(&self, account_id: &str, pipeline_id: &str) -> ShouldQueueResponse {
        let tier = match self.tiers.resolve_tier(account_id).await {
            Ok(tier) => tier,
            Err(e) => {
                warn!("Tier lookup failed for account {}, admitting: {}", account_id, e);
                return ShouldQueueResponse { should_queue: false };
            }
        };
        let running = match self.store.find_running_count(pipeline_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Running count lookup failed for pipeline {}, admitting: {}", pipeline_id, e);
                return ShouldQueueResponse { should_queue: false };
            }
        };

        let ceiling = self.config.ceiling(tier);
        let should_queue = running >= ceiling;
        debug!(
            "Admission for pipeline {} ({:?}): {} running, ceiling {}, queue = {}",
            pipeline_id, tier, running, ceiling, should_queue
        );
        ShouldQueueResponse { should_queue }
    }
}
