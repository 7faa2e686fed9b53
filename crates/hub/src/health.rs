//! `GET /health` liveness/readiness endpoint (§11 supplemented ambient
//! surface). Reports healthy only if Redis actually answers a `PING`, not
//! just that the process is up, the same liveness-vs-readiness distinction
//! the pack's webhook-delivery example draws.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub redis_client: Arc<redis::Client>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis_ok: bool,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let redis_ok = match state.redis_client.get_multiplexed_async_connection().await {
        Ok(mut con) => redis::cmd("PING").query_async::<String>(&mut con).await.is_ok(),
        Err(_) => false,
    };
    Json(HealthResponse { status: if redis_ok { "ok" } else { "degraded" }, redis_ok })
}
