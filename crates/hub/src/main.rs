//! jobmesh-hub: the submission/cancel/progress HTTP API, SSE bridge, legacy
//! WebSocket interface, webhook dispatcher, and stale-worker sweeper.

use jobmesh_hub::api::{self, ApiState};
use jobmesh_hub::bridge::Bridge;
use jobmesh_hub::broker::Broker;
use jobmesh_hub::config::Config;
use jobmesh_hub::health::{self, HealthState};
use jobmesh_hub::webhook::Dispatcher;
use jobmesh_hub::webhook_api::{self, WebhookApiState};
use jobmesh_hub::{sweeper, ws};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    info!("jobmesh-hub starting up...");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    info!(
        http_addr = %config.http_addr,
        claim_max_scan = config.claim_max_scan,
        sse_queue_capacity = config.sse_queue_capacity,
        "resolved configuration"
    );

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    info!("connected to Redis");

    let broker = Arc::new(Broker::new(redis_client.clone()));
    let bridge = Bridge::new(redis_client.clone(), config.sse_queue_capacity);
    let dispatcher = Dispatcher::new(config.webhook_max_attempts, config.webhook_retry_base);
    let subscriptions = Arc::new(RwLock::new(Vec::new()));
    let webhook_tx = dispatcher.spawn(subscriptions.clone());

    let api_state = ApiState { broker: broker.clone(), bridge: bridge.clone(), webhook_tx: Some(webhook_tx) };
    let health_state = HealthState { redis_client: Arc::new(redis_client.clone()) };
    let webhook_api_state = WebhookApiState { subscriptions };

    let app = axum::Router::new()
        .merge(api::router(api_state.clone()))
        .merge(ws::router(api_state))
        .merge(health::router(health_state))
        .merge(webhook_api::router(webhook_api_state));

    let sweeper_client = redis_client.clone();
    let sweeper_config = config.clone();
    tokio::spawn(async move {
        sweeper::run(sweeper_client, sweeper_config).await;
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "listening");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, draining in-flight requests");
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    info!("jobmesh-hub stopped");
    Ok(())
}
