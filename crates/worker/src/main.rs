//! jobmesh-worker: single-job worker runtime, connector manager, and the
//! protocol connector framework (§4.3/§4.4). Concrete provider connectors
//! (ComfyUI/OpenAI/Automatic1111 payload shapes) are out of scope (§1
//! Non-goals: "specific provider payload shapes") — this binary wires up
//! the `simulation` connector as the one concrete, runnable example and
//! fallback target (§4.3 step 4's `-sim`/`sim` rule).

use jobmesh_worker::broker::WorkerBroker;
use jobmesh_worker::config::Config;
use jobmesh_worker::connector::manager::ConnectorManager;
use jobmesh_worker::connector::simulation::SimulationConnector;
use jobmesh_worker::connector::websocket::ActivityNotice;
use jobmesh_worker::connector::Connector;
use jobmesh_worker::health::{self, HealthState};
use jobmesh_worker::runtime::Runtime;
use jobmesh_common::model::{IsolationPolicy, WorkerCapabilities};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    info!("jobmesh-worker starting up...");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    info!(
        worker_id = %config.worker_id,
        machine_id = %config.machine_id,
        services = ?config.connector_counts.keys().collect::<Vec<_>>(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        job_timeout_secs = config.job_timeout.as_secs(),
        "resolved configuration"
    );

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    info!("connected to Redis");

    let broker =
        Arc::new(WorkerBroker::new(redis_client.clone(), config.worker_id.clone(), config.claim_max_scan));

    let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
    let mut services: Vec<String> = Vec::new();
    for service_type in config.connector_counts.keys() {
        services.push(service_type.clone());
        let lower = service_type.to_lowercase();
        if lower == "simulation" || lower.ends_with("-sim") || lower.contains("sim") {
            connectors.push(Arc::new(SimulationConnector::new(
                format!("{}-sim", config.worker_id),
                redis_client.clone(),
                std::time::Duration::from_millis(500),
            )));
        }
    }
    if connectors.is_empty() {
        // Always carry a simulation connector so the `-sim`/`sim` fallback
        // rule (§4.3 step 4) has something to fall back to even when no
        // `WORKERS` entry names it explicitly.
        connectors.push(Arc::new(SimulationConnector::new(
            format!("{}-sim", config.worker_id),
            redis_client.clone(),
            std::time::Duration::from_millis(500),
        )));
    }

    let mut manager = ConnectorManager::new(redis_client.clone(), connectors);
    manager.initialize_all().await;
    let manager = Arc::new(Mutex::new(manager));

    let capabilities = WorkerCapabilities {
        services,
        hardware: Default::default(),
        models: Vec::new(),
        isolation: IsolationPolicy::None,
        concurrent_jobs: 1,
        region: None,
        cost_tier: None,
        tags: Vec::new(),
    };

    let health_state = HealthState { redis_client: Arc::new(redis_client.clone()), manager: manager.clone() };
    let app = health::router(health_state);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let (_activity_tx, activity_rx) = tokio::sync::mpsc::channel::<ActivityNotice>(64);

    let runtime = Arc::new(Runtime::new(broker, manager, capabilities, config));
    let runtime_handle = tokio::spawn(runtime.run(shutdown_rx, activity_rx));

    let http_server = axum::serve(listener, app);
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "health server stopped unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = runtime_handle.await;
    info!("jobmesh-worker stopped");
    Ok(())
}
