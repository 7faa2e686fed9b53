//! Stale-worker sweeper (§4.3 "Heartbeat").
//!
//! Workers missing 3 consecutive heartbeats are considered stale; their
//! active jobs are moved back to `jobs:pending` with `retry_count += 1` and
//! a `system_error/worker_lost` failure attestation is written (§8 scenario
//! 5). Runs on its own tick, independent of the per-job timeout sweep that
//! lives in `jobmesh-worker` (§4.3).

use crate::broker::Broker;
use crate::config::Config;
use jobmesh_common::attestation::{self, AttestationInput};
use jobmesh_common::classifier::{Classification, FailureType};
use jobmesh_common::keys;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn run(client: redis::Client, config: Config) {
    let broker = Broker::new(client.clone());
    let mut interval = tokio::time::interval(config.sweep_interval);
    let heartbeat_interval_ms = 30_000i64; // matches worker default (§6 WORKER_HEARTBEAT_INTERVAL)
    let stale_after_ms = heartbeat_interval_ms * config.stale_worker_heartbeat_misses as i64;

    loop {
        interval.tick().await;
        if let Err(e) = sweep_once(&broker, &client, stale_after_ms).await {
            warn!(error = %e, "stale-worker sweep failed, will retry next tick");
        }
    }
}

async fn sweep_once(broker: &Broker, client: &redis::Client, stale_after_ms: i64) -> Result<(), crate::broker::BrokerError> {
    let now = now_ms();
    let worker_ids = broker.registered_worker_ids().await?;

    for worker_id in worker_ids {
        let last_heartbeat = broker.worker_heartbeat_ms(&worker_id).await?;
        let is_stale = match last_heartbeat {
            Some(ts) => now - ts > stale_after_ms,
            None => true,
        };
        if !is_stale {
            continue;
        }

        warn!(worker_id = %worker_id, "worker missed heartbeats; recovering its active jobs");
        let job_ids = broker.active_job_ids(&worker_id).await?;
        for job_id in job_ids {
            recover_job(broker, client, &worker_id, &job_id, now).await?;
        }
        broker.deregister_worker(&worker_id).await?;
        info!(worker_id = %worker_id, "stale worker deregistered");
    }
    Ok(())
}

async fn recover_job(
    broker: &Broker,
    client: &redis::Client,
    worker_id: &str,
    job_id: &str,
    now: i64,
) -> Result<(), crate::broker::BrokerError> {
    let job = match broker.get_job(job_id).await? {
        Some(j) => j,
        None => return Ok(()),
    };

    let requeued = broker.recover_stale_job(worker_id, job_id, now).await?;
    if !requeued {
        return Ok(());
    }

    let classification = Classification {
        failure_type: FailureType::SystemError,
        reason: "worker_lost",
        description: format!("worker {worker_id} missed heartbeats while processing this job"),
    };
    let input = AttestationInput {
        job_id,
        worker_id,
        machine_id: "unknown",
        worker_version: "unknown",
        workflow_id: job.workflow_id.as_deref(),
        step: job.step,
        total_steps: job.total_steps,
        retry_count: job.retry_count + 1,
        max_retries: job.max_retries,
        now_ms: now,
        raw_request: None,
        raw_response: None,
    };
    let att = attestation::failure_attestation(&input, &classification, true);
    let (key, ttl) = attestation::attestation_key_and_ttl(&att, job.retry_count + 1);

    let mut con = client.get_multiplexed_async_connection().await?;
    let body = serde_json::to_string(&att).unwrap_or_default();
    let _: () = con.set_ex(&key, body, ttl as u64).await?;
    if let Some(wf) = job.workflow_id.as_deref() {
        if job.retry_count + 1 >= job.max_retries {
            let wf_key = keys::workflow_failure_permanent_key(wf);
            let _: () = con
                .set_ex(wf_key, serde_json::to_string(&att).unwrap_or_default(), keys::PERMANENT_ATTESTATION_TTL_SECS as u64)
                .await?;
        }
    }
    Ok(())
}
