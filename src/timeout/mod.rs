//! Timeout service: fire-once, cancellable deadlines
//!
//! Each registered timeout is a spawned task racing its deadline against a
//! cancellation token. Only pending timeouts are tracked: firing and
//! cancelling both take the entry out of the map, and whichever gets it
//! first wins; the loser is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// What a timeout is guarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutDimension {
    /// Static timeout declared on a plan node
    NodeTimeout,
    /// Deadline of an intervention wait
    InterventionWait,
    /// Delay before a retry attempt is dispatched
    RetryWait,
    /// Overall deadline of an approval
    ApprovalDeadline,
    /// Delay before the next approval poll
    ApprovalPoll,
}

/// Absolute deadline of a timeout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutTracker {
    pub deadline: DateTime<Utc>,
}

impl TimeoutTracker {
    pub fn at(deadline: DateTime<Utc>) -> Self {
        Self { deadline }
    }

    pub fn after(duration: Duration) -> Self {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { deadline }
    }

    /// Time left until the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutInstance {
    pub id: Uuid,
    pub dimension: TimeoutDimension,
    pub tracker: TimeoutTracker,
    pub created_at: DateTime<Utc>,
}

/// Action run when a timeout fires
#[async_trait]
pub trait TimeoutCallback: Send + Sync {
    async fn on_timeout(&self, instance: TimeoutInstance);
}

struct TimeoutEntry {
    instance: TimeoutInstance,
    token: CancellationToken,
}

/// Schedules timeouts on the tokio runtime
#[derive(Clone)]
pub struct TimeoutService {
    entries: Arc<DashMap<Uuid, TimeoutEntry>>,
    shutdown: CancellationToken,
}

impl TimeoutService {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a timeout and return its id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        dimension: TimeoutDimension,
        tracker: TimeoutTracker,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Uuid {
        let instance = TimeoutInstance {
            id: Uuid::new_v4(),
            dimension,
            tracker,
            created_at: Utc::now(),
        };
        let id = instance.id;
        let token = self.shutdown.child_token();

        self.entries.insert(
            id,
            TimeoutEntry {
                instance,
                token: token.clone(),
            },
        );
        debug!("Registered {:?} timeout {} due at {}", dimension, id, tracker.deadline);

        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Timeout {} cancelled before firing", id);
                }
                _ = tokio::time::sleep(tracker.remaining()) => {
                    if let Some((_, entry)) = entries.remove(&id) {
                        debug!("Timeout {} fired ({:?})", id, entry.instance.dimension);
                        callback.on_timeout(entry.instance).await;
                    }
                }
            }
        });

        id
    }

    /// Register a timeout that fires after `duration`
    pub fn register_after(
        &self,
        dimension: TimeoutDimension,
        duration: Duration,
        callback: Arc<dyn TimeoutCallback>,
    ) -> Uuid {
        self.register(dimension, TimeoutTracker::after(duration), callback)
    }

    /// Cancel a pending timeout. Returns `false` unless it was still pending.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel several timeouts, returning how many were still pending
    pub fn cancel_all<'a>(&self, ids: impl IntoIterator<Item = &'a Uuid>) -> usize {
        ids.into_iter().filter(|id| self.cancel(**id)).count()
    }

    /// Whether the timeout has neither fired nor been cancelled
    pub fn is_pending(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    /// A pending timeout's instance
    pub fn instance(&self, id: Uuid) -> Option<TimeoutInstance> {
        self.entries.get(&id).map(|entry| entry.instance.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Stop every pending timeout without firing it
    pub fn shutdown(&self) {
        self.entries.clear();
        self.shutdown.cancel();
    }
}

impl Default for TimeoutService {
    fn default() -> Self {
        Self::new()
    }
}
