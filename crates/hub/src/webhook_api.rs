//! Webhook subscription management (§4.1 "Webhook subscription" data model,
//! §4.7 dispatcher). Not named as its own HTTP surface in the distilled
//! spec, but without *some* way to register a `WebhookSubscription` the
//! dispatcher in `webhook.rs` can never match an event — this is the
//! minimal CRUD the dispatcher needs to be reachable, shaped like the rest
//! of this crate's submission API.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{http::StatusCode, Json, Router};
use jobmesh_common::model::{WebhookFilter, WebhookSubscription};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub type Subscriptions = Arc<RwLock<Vec<WebhookSubscription>>>;

#[derive(Clone)]
pub struct WebhookApiState {
    pub subscriptions: Subscriptions,
}

pub fn router(state: WebhookApiState) -> Router {
    Router::new()
        .route("/webhooks", post(register).get(list))
        .route("/webhooks/{id}", delete(unregister))
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterWebhookRequest {
    url: String,
    events: Vec<String>,
    #[serde(default)]
    filter: WebhookFilter,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
}

async fn register(
    State(state): State<WebhookApiState>,
    Json(req): Json<RegisterWebhookRequest>,
) -> (StatusCode, Json<WebhookSubscription>) {
    let sub = WebhookSubscription {
        id: uuid::Uuid::new_v4().to_string(),
        url: req.url,
        events: req.events,
        filter: req.filter,
        secret: req.secret,
        max_attempts: req.max_attempts.unwrap_or(5),
        headers: req.headers,
    };
    info!(webhook_id = %sub.id, url = %sub.url, "webhook subscription registered");
    state.subscriptions.write().await.push(sub.clone());
    (StatusCode::CREATED, Json(sub))
}

async fn list(State(state): State<WebhookApiState>) -> Json<Vec<WebhookSubscription>> {
    Json(state.subscriptions.read().await.clone())
}

async fn unregister(State(state): State<WebhookApiState>, Path(id): Path<String>) -> StatusCode {
    let mut subs = state.subscriptions.write().await;
    let before = subs.len();
    subs.retain(|s| s.id != id);
    if subs.len() == before {
        StatusCode::NOT_FOUND
    } else {
        info!(webhook_id = %id, "webhook subscription removed");
        StatusCode::NO_CONTENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_list_then_unregister_round_trips() {
        let state = WebhookApiState { subscriptions: Arc::new(RwLock::new(Vec::new())) };

        let (status, Json(sub)) = register(
            State(state.clone()),
            Json(RegisterWebhookRequest {
                url: "https://example.com/hook".to_string(),
                events: vec!["job_completed".to_string()],
                filter: WebhookFilter::default(),
                secret: Some("s3cr3t".to_string()),
                max_attempts: None,
                headers: Default::default(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sub.max_attempts, 5);

        let listed = list(State(state.clone())).await.0;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sub.id);

        let removed_status = unregister(State(state.clone()), Path(sub.id.clone())).await;
        assert_eq!(removed_status, StatusCode::NO_CONTENT);
        assert!(list(State(state)).await.0.is_empty());
    }

    #[tokio::test]
    async fn unregister_missing_id_is_not_found() {
        let state = WebhookApiState { subscriptions: Arc::new(RwLock::new(Vec::new())) };
        let status = unregister(State(state), Path("missing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
