// Cluster confirmation channel: asks a node which triggers it is executing

pub mod http;

pub use http::{router, HttpConfirmationClient};

use crate::errors::ConfirmationError;
use crate::models::TriggerKey;
use crate::store::ClusteredJobStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Request/response channel to another cluster member
#[async_trait]
pub trait ExecutionConfirmation: Send + Sync {
    /// Which of `keys` node `node_id` is executing right now for `scheduler_name`
    async fn executing_triggers(
        &self,
        node_id: &str,
        scheduler_name: &str,
        keys: &[TriggerKey],
    ) -> Result<HashSet<TriggerKey>, ConfirmationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub trigger_keys: Vec<TriggerKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub node: String,
    pub executing: Vec<TriggerKey>,
}

/// Answers confirmation requests from the local store
#[derive(Clone)]
pub struct ConfirmationHandler {
    store: Arc<ClusteredJobStore>,
}

impl ConfirmationHandler {
    pub fn new(store: Arc<ClusteredJobStore>) -> Self {
        Self { store }
    }

    pub fn scheduler_name(&self) -> &str {
        self.store.scheduler_name()
    }

    pub fn handle(&self, request: &ConfirmationRequest) -> ConfirmationResponse {
        let mut executing: Vec<TriggerKey> = self
            .store
            .executing_trigger_keys(&request.trigger_keys)
            .into_iter()
            .collect();
        executing.sort();
        debug!(
            asked = request.trigger_keys.len(),
            executing = executing.len(),
            "Answered execution confirmation"
        );
        ConfirmationResponse {
            node: self.store.node_id().to_string(),
            executing,
        }
    }
}

/// Confirmation channel for stores living in the same process
#[derive(Default)]
pub struct InProcessConfirmation {
    handlers: RwLock<HashMap<(String, String), ConfirmationHandler>>,
}

impl InProcessConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: ConfirmationHandler) {
        let key = (
            handler.store.node_id().to_string(),
            handler.scheduler_name().to_string(),
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler);
    }

    /// Simulate a node leaving the cluster
    pub fn deregister(&self, node_id: &str, scheduler_name: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(node_id.to_string(), scheduler_name.to_string()));
    }
}

#[async_trait]
impl ExecutionConfirmation for InProcessConfirmation {
    async fn executing_triggers(
        &self,
        node_id: &str,
        scheduler_name: &str,
        keys: &[TriggerKey],
    ) -> Result<HashSet<TriggerKey>, ConfirmationError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(node_id.to_string(), scheduler_name.to_string()))
            .cloned()
            .ok_or_else(|| ConfirmationError::UnknownNode(node_id.to_string()))?;

        let response = handler.handle(&ConfirmationRequest {
            trigger_keys: keys.to_vec(),
        });
        Ok(response.executing.into_iter().collect())
    }
}
