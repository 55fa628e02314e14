//! Wait/notify engine
//!
//! Correlates the wait id of an in-flight external unit of work with a
//! callback. Each correlation owns a oneshot channel: `resolve` removes the
//! sender from the table and sends the response, and a listener task spawned
//! by `correlate` hands it to the callback. Removal from the table is what
//! makes delivery at-most-once.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Result delivered for a wait id by the external completion path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub success: bool,

    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub error_message: Option<String>,
}

impl NotifyResponse {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error_message: Some(message.into()),
        }
    }

    /// Attach a value to the response map
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Receiver of a correlated response
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    async fn notify(&self, response: NotifyResponse);

    async fn notify_error(&self, response: NotifyResponse);
}

#[derive(Clone, Default)]
pub struct WaitNotifyEngine {
    waiters: Arc<DashMap<String, oneshot::Sender<NotifyResponse>>>,
}

impl WaitNotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `wait_id`. Must happen before the work
    /// carrying that wait id is dispatched.
    ///
    /// Returns `false` (and registers nothing) if the wait id is already
    /// correlated.
    pub fn correlate(&self, wait_id: impl Into<String>, callback: Arc<dyn NotifyCallback>) -> bool {
        let wait_id = wait_id.into();
        let (tx, rx) = oneshot::channel::<NotifyResponse>();

        match self.waiters.entry(wait_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Wait id {} is already correlated", wait_id);
                return false;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        debug!("Correlated wait id {}", wait_id);

        tokio::spawn(async move {
            match rx.await {
                Ok(response) if response.success => callback.notify(response).await,
                Ok(response) => callback.notify_error(response).await,
                Err(_) => debug!("Correlation {} dropped without a response", wait_id),
            }
        });

        true
    }

    /// Deliver the response for `wait_id`.
    ///
    /// Returns `false` when nothing is correlated, which is the case for a
    /// duplicate delivery or a cancelled correlation.
    pub fn resolve(&self, wait_id: &str, response: NotifyResponse) -> bool {
        match self.waiters.remove(wait_id) {
            Some((_, sender)) => {
                if sender.send(response).is_err() {
                    warn!("Listener for wait id {} is gone", wait_id);
                }
                true
            }
            None => {
                info!("Dropping response for wait id {}: no correlation (duplicate or cancelled)", wait_id);
                false
            }
        }
    }

    /// Drop a correlation so that a late response is ignored
    pub fn cancel(&self, wait_id: &str) -> bool {
        self.waiters.remove(wait_id).is_some()
    }

    pub fn is_waiting(&self, wait_id: &str) -> bool {
        self.waiters.contains_key(wait_id)
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}
