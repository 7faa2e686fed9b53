//! `GET /health` liveness/readiness endpoint (§11 supplemented ambient
//! surface), mirroring `jobmesh-hub`'s: healthy only if Redis answers PING,
//! plus the aggregate connector health used by the worker's own monitoring.

use crate::connector::manager::ConnectorManager;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct HealthState {
    pub redis_client: Arc<redis::Client>,
    pub manager: Arc<Mutex<ConnectorManager>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis_ok: bool,
    connectors: Vec<jobmesh_common::model::ConnectorStatusReport>,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let redis_ok = match state.redis_client.get_multiplexed_async_connection().await {
        Ok(mut con) => redis::cmd("PING").query_async::<String>(&mut con).await.is_ok(),
        Err(_) => false,
    };
    let connectors = state.manager.lock().await.aggregate_health();
    Json(HealthResponse { status: if redis_ok { "ok" } else { "degraded" }, redis_ok, connectors })
}
