// HTTP transport for execution confirmation between cluster members

use super::{ConfirmationHandler, ConfirmationRequest, ConfirmationResponse, ExecutionConfirmation};
use crate::config::ClusterConfig;
use crate::errors::ConfirmationError;
use crate::models::TriggerKey;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Asks peers over HTTP; peers are addressed by node id through a static map
pub struct HttpConfirmationClient {
    client: Client,
    peers: HashMap<String, String>,
}

impl HttpConfirmationClient {
    pub fn new(peers: HashMap<String, String>, timeout: Duration) -> Result<Self, ConfirmationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfirmationError::Transport {
                node: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, peers })
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self, ConfirmationError> {
        Self::new(
            config.peers.clone(),
            Duration::from_millis(config.confirm_timeout_ms),
        )
    }

    fn endpoint(&self, node_id: &str, scheduler_name: &str) -> Result<String, ConfirmationError> {
        let base = self
            .peers
            .get(node_id)
            .ok_or_else(|| ConfirmationError::UnknownNode(node_id.to_string()))?;
        Ok(format!(
            "{}/_scheduler/{}/executing",
            base.trim_end_matches('/'),
            scheduler_name
        ))
    }
}

#[async_trait]
impl ExecutionConfirmation for HttpConfirmationClient {
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn executing_triggers(
        &self,
        node_id: &str,
        scheduler_name: &str,
        keys: &[TriggerKey],
    ) -> Result<HashSet<TriggerKey>, ConfirmationError> {
        let url = self.endpoint(node_id, scheduler_name)?;
        let request = ConfirmationRequest {
            trigger_keys: keys.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| with_node(e.into(), node_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConfirmationError::Remote {
                node: node_id.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        let answer: ConfirmationResponse = response
            .json()
            .await
            .map_err(|e| with_node(e.into(), node_id))?;
        // Another node's answer says nothing about what still runs on `node_id`
        if answer.node != node_id {
            warn!(asked = %node_id, answered = %answer.node, "Confirmation answered by a different node");
            return Err(ConfirmationError::Remote {
                node: node_id.to_string(),
                reason: format!("answered by node {}", answer.node),
            });
        }
        debug!(executing = answer.executing.len(), "Received execution confirmation");
        Ok(answer.executing.into_iter().collect())
    }
}

/// Transport errors only know the host; report the node id instead
fn with_node(err: ConfirmationError, node_id: &str) -> ConfirmationError {
    match err {
        ConfirmationError::Timeout(_) => ConfirmationError::Timeout(node_id.to_string()),
        ConfirmationError::Transport { reason, .. } => ConfirmationError::Transport {
            node: node_id.to_string(),
            reason,
        },
        other => other,
    }
}

/// Router serving `POST /_scheduler/{scheduler_name}/executing`
pub fn router(handler: ConfirmationHandler) -> Router {
    Router::new()
        .route(
            "/_scheduler/:scheduler_name/executing",
            post(executing_triggers),
        )
        .with_state(handler)
}

#[tracing::instrument(skip(handler, request), fields(keys = request.trigger_keys.len()))]
async fn executing_triggers(
    State(handler): State<ConfirmationHandler>,
    Path(scheduler_name): Path<String>,
    Json(request): Json<ConfirmationRequest>,
) -> Result<Json<ConfirmationResponse>, (StatusCode, String)> {
    if scheduler_name != handler.scheduler_name() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Unknown scheduler: {}", scheduler_name),
        ));
    }
    Ok(Json(handler.handle(&request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InProcessConfirmation;
    use crate::persistence::InMemoryStatusRepository;
    use crate::source::{DefaultJobFactory, InMemoryJobConfigSource};
    use crate::store::{ClusteredJobStore, StoreOptions};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler() -> ConfirmationHandler {
        let store = ClusteredJobStore::new(
            StoreOptions {
                node_id: "node-b".to_string(),
                scheduler_name: "main".to_string(),
                ..StoreOptions::default()
            },
            Arc::new(InMemoryStatusRepository::new()),
            Arc::new(InMemoryJobConfigSource::default()),
            Arc::new(DefaultJobFactory),
            Arc::new(InProcessConfirmation::new()),
        );
        ConfirmationHandler::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_client_posts_keys_and_reads_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_scheduler/main/executing"))
            .and(body_json(serde_json::json!({
                "triggerKeys": [{"group": "g", "name": "a"}, {"group": "g", "name": "b"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "node": "node-b",
                "executing": [{"group": "g", "name": "b"}]
            })))
            .mount(&server)
            .await;

        let client = HttpConfirmationClient::new(
            HashMap::from([("node-b".to_string(), server.uri())]),
            Duration::from_secs(2),
        )
        .unwrap();
        let running = client
            .executing_triggers(
                "node-b",
                "main",
                &[TriggerKey::new("g", "a"), TriggerKey::new("g", "b")],
            )
            .await
            .unwrap();
        assert_eq!(running, HashSet::from([TriggerKey::new("g", "b")]));
    }

    #[tokio::test]
    async fn test_client_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpConfirmationClient::new(
            HashMap::from([("node-b".to_string(), server.uri())]),
            Duration::from_secs(2),
        )
        .unwrap();
        let result = client.executing_triggers("node-b", "main", &[]).await;
        assert!(matches!(result, Err(ConfirmationError::Remote { node, .. }) if node == "node-b"));
    }

    #[tokio::test]
    async fn test_client_rejects_answer_from_other_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_scheduler/main/executing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "node": "node-c",
                "executing": []
            })))
            .mount(&server)
            .await;

        let client = HttpConfirmationClient::new(
            HashMap::from([("node-b".to_string(), server.uri())]),
            Duration::from_secs(2),
        )
        .unwrap();
        let result = client
            .executing_triggers("node-b", "main", &[TriggerKey::new("g", "a")])
            .await;
        assert!(matches!(result, Err(ConfirmationError::Remote { node, .. }) if node == "node-b"));
    }

    #[tokio::test]
    async fn test_client_rejects_unknown_peer() {
        let client = HttpConfirmationClient::new(HashMap::new(), Duration::from_secs(1)).unwrap();
        let result = client.executing_triggers("node-x", "main", &[]).await;
        assert!(matches!(result, Err(ConfirmationError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_router_answers_for_own_scheduler() {
        let app = router(handler());
        let request = Request::builder()
            .method("POST")
            .uri("/_scheduler/main/executing")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"triggerKeys":[{"group":"g","name":"a"}]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let answer: ConfirmationResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(answer.node, "node-b");
        assert!(answer.executing.is_empty());
    }

    #[tokio::test]
    async fn test_router_rejects_other_scheduler() {
        let app = router(handler());
        let request = Request::builder()
            .method("POST")
            .uri("/_scheduler/other/executing")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"triggerKeys":[]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
