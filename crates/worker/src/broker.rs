//! Worker-side broker operations (§4.2/§4.3): `RequestJob`, `UpdateProgress`,
//! `Complete`, `Fail`.
//!
//! These run directly against Redis from the worker process rather than
//! through `jobmesh-hub`, since a worker must keep claiming and finishing
//! jobs even if the hub binary is down (all cross-component communication
//! is through Redis, §3/§5). The claim/requeue Lua source is shared with
//! `jobmesh-hub::broker` via `jobmesh_common::scripts` so both processes
//! stay atomicity-compatible without depending on each other.

use jobmesh_common::attestation::{self, AttestationInput};
use jobmesh_common::classifier::Classification;
use jobmesh_common::keys;
use jobmesh_common::model::{Job, JobStatus, WorkerCapabilities};
use jobmesh_common::scripts;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum WorkerBrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    JobMesh(#[from] jobmesh_common::JobMeshError),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct WorkerBroker {
    client: redis::Client,
    worker_id: String,
    max_scan: usize,
}

impl WorkerBroker {
    pub fn new(client: redis::Client, worker_id: String, max_scan: usize) -> Self {
        WorkerBroker { client, worker_id, max_scan }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, WorkerBrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// `RequestJob(capabilities) -> Option<Job>` (§4.2, §4.3 step 1).
    pub async fn request_job(&self, capabilities: &WorkerCapabilities) -> Result<Option<Job>, WorkerBrokerError> {
        let mut con = self.conn().await?;
        let caps_json = serde_json::to_string(capabilities)?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let script = redis::Script::new(scripts::CLAIM_JOB);
        let claimed: redis::Value = script
            .key(keys::PENDING_QUEUE)
            .arg(&self.worker_id)
            .arg(&caps_json)
            .arg(now_ms)
            .arg(self.max_scan)
            .invoke_async(&mut con)
            .await?;

        let job_id = match claimed {
            redis::Value::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
            redis::Value::SimpleString(s) => s,
            _ => return Ok(None),
        };

        let fields: HashMap<String, String> = con.hgetall(keys::job_key(&job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let job = Job::from_redis_fields(&fields)?;

        // The Lua `CLAIM_JOB` script is the sole source of truth for the
        // claim itself (atomicity requires it run server-side), but
        // `jobmesh_common::capability::matches` implements the identical
        // rules (a)-(e) in Rust. Cross-check every claim against it so a
        // divergence between the two implementations surfaces immediately
        // instead of silently granting a job a worker can't actually honor.
        if !jobmesh_common::capability_matches(&job, capabilities) {
            warn!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                "claimed job fails local capability cross-check; Lua and Rust matching semantics have diverged"
            );
        }

        Ok(Some(job))
    }

    /// `UpdateProgress(job_id, progress, message)` (§4.3 step 5). `terminal`
    /// is set on the final entry for a job so the event bridge (§4.6) can
    /// derive `job_completed`/`job_failed`/`job_cancelled` without a second
    /// Redis round trip.
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        message: Option<&str>,
        terminal: Option<&str>,
    ) -> Result<(), WorkerBrokerError> {
        self.update_progress_inner(job_id, progress, message, terminal, false).await
    }

    /// Writes the one entry a job's progress stream gets right after a
    /// worker claims it, flagged `started` so the event bridge can emit
    /// `job_started` (§6) from a reachable signal (§4.3 step 3/4).
    pub async fn announce_started(&self, job_id: &str) -> Result<(), WorkerBrokerError> {
        self.update_progress_inner(job_id, 0, None, None, true).await
    }

    async fn update_progress_inner(
        &self,
        job_id: &str,
        progress: u8,
        message: Option<&str>,
        terminal: Option<&str>,
        started: bool,
    ) -> Result<(), WorkerBrokerError> {
        let mut con = self.conn().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut fields: Vec<(&str, String)> = vec![
            ("progress", progress.to_string()),
            ("worker_id", self.worker_id.clone()),
            ("ts", now_ms.to_string()),
        ];
        if let Some(m) = message {
            fields.push(("message", m.to_string()));
        }
        if let Some(status) = terminal {
            fields.push(("status", status.to_string()));
        }
        if started {
            fields.push(("started", "1".to_string()));
        }
        let _: String = con.xadd(keys::progress_stream(job_id), "*", &fields).await?;
        Ok(())
    }

    /// `Complete(job_id, result)` (§4.3 step 6). Retries its own Redis calls
    /// with capped exponential backoff (§7) since the job is in-flight and
    /// must reach a terminal state.
    pub async fn complete(
        &self,
        job: &Job,
        worker_version: &str,
        machine_id: &str,
        raw_request: Option<&serde_json::Value>,
        raw_response: Option<&serde_json::Value>,
    ) -> Result<(), WorkerBrokerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let input = AttestationInput {
            job_id: &job.id,
            worker_id: &self.worker_id,
            machine_id,
            worker_version,
            workflow_id: job.workflow_id.as_deref(),
            step: job.step,
            total_steps: job.total_steps,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            now_ms,
            raw_request,
            raw_response,
        };
        let att = attestation::completion_attestation(&input);
        let (key, ttl) = attestation::attestation_key_and_ttl(&att, job.retry_count + 1);
        let body = serde_json::to_string(&att)?;

        with_retry(5, Duration::from_millis(200), || async {
            let mut con = self.conn().await?;
            let script = redis::Script::new(scripts::COMPLETE_JOB);
            let ok: bool = script.key(keys::job_key(&job.id)).arg(&self.worker_id).invoke_async(&mut con).await?;
            if !ok {
                warn!(job_id = %job.id, "COMPLETE_JOB no-op: job no longer assigned to this worker");
            }
            let _: () = con.hdel(keys::active_set_key(&self.worker_id), &job.id).await?;
            let _: () = con.set_ex(&key, &body, ttl as u64).await?;
            Ok(())
        })
        .await
    }

    /// `Fail(job_id, error, classification)` (§4.3 step 7). Applies the
    /// dead-letter rule from §9: at `retry_count == max_retries`, the next
    /// retryable failure still becomes permanent.
    pub async fn fail(
        &self,
        job: &Job,
        classification: &Classification,
        worker_version: &str,
        machine_id: &str,
        raw_request: Option<&serde_json::Value>,
        raw_response: Option<&serde_json::Value>,
    ) -> Result<bool, WorkerBrokerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let retryable = classification.failure_type.is_retryable() && job.retry_count < job.max_retries;

        let input = AttestationInput {
            job_id: &job.id,
            worker_id: &self.worker_id,
            machine_id,
            worker_version,
            workflow_id: job.workflow_id.as_deref(),
            step: job.step,
            total_steps: job.total_steps,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            now_ms,
            raw_request,
            raw_response,
        };
        let att = attestation::failure_attestation(&input, classification, retryable);
        let (key, ttl) = attestation::attestation_key_and_ttl(&att, job.retry_count + 1);
        let body = serde_json::to_string(&att)?;

        let will_retry = retryable;
        with_retry(5, Duration::from_millis(200), || async {
            let mut con = self.conn().await?;
            let _: () = con.set_ex(&key, &body, ttl as u64).await?;

            if will_retry {
                let score = keys::pending_score(job.priority, now_ms);
                let script = redis::Script::new(scripts::REQUEUE_JOB);
                let _: bool = script
                    .key(keys::PENDING_QUEUE)
                    .key(keys::job_key(&job.id))
                    .key(keys::active_set_key(&self.worker_id))
                    .arg(&job.id)
                    .arg(score)
                    .arg(now_ms)
                    .invoke_async(&mut con)
                    .await?;
            } else {
                let _: () = con.hdel(keys::active_set_key(&self.worker_id), &job.id).await?;
                let _: () = con.hset(keys::job_key(&job.id), "status", "failed").await?;

                // Completion keys MUST also exist for permanent failures
                // (§4.5 backwards-compatibility requirement) so readers that
                // only watch completion keys still observe a terminal state.
                let completion = jobmesh_common::model::Attestation {
                    kind: jobmesh_common::model::AttestationKind::Completion,
                    completed_at_ms: Some(now_ms),
                    failed_at_ms: None,
                    error_message: att.error_message.clone(),
                    failure_type: att.failure_type.clone(),
                    failure_reason: att.failure_reason.clone(),
                    failure_description: att.failure_description.clone(),
                    will_retry: false,
                    ..att.clone()
                };
                let (completion_key, completion_ttl) = attestation::attestation_key_and_ttl(&completion, job.retry_count + 1);
                let completion_body = serde_json::to_string(&completion)?;
                let _: () = con.set_ex(&completion_key, &completion_body, completion_ttl as u64).await?;

                if let Some(wf) = job.workflow_id.as_deref() {
                    let wf_key = keys::workflow_failure_permanent_key(wf);
                    let _: () = con.set_ex(&wf_key, &body, keys::PERMANENT_ATTESTATION_TTL_SECS as u64).await?;
                }
            }
            Ok(())
        })
        .await?;

        Ok(will_retry)
    }

    pub async fn register(&self, record: &jobmesh_common::model::WorkerRecord) -> Result<(), WorkerBrokerError> {
        let mut con = self.conn().await?;
        let fields = record.to_redis_fields();
        let _: () = con.hset_multiple(keys::worker_key(&self.worker_id), &fields).await?;
        let _: () = con.sadd(keys::WORKERS_INDEX, &self.worker_id).await?;
        Ok(())
    }

    pub async fn heartbeat(&self, now_ms: i64, status: &str, jobs_processed: u64) -> Result<(), WorkerBrokerError> {
        let mut con = self.conn().await?;
        let _: () = con
            .hset_multiple(
                keys::worker_key(&self.worker_id),
                &[
                    ("last_heartbeat_ms", now_ms.to_string()),
                    ("status", status.to_string()),
                    ("jobs_processed", jobs_processed.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Blocks up to 5s waiting for a new command entry (mirrors the hub's
    /// `bridge.rs` per-entity stream read) so `command_listener`'s loop
    /// doesn't busy-poll Redis on every empty read.
    pub async fn next_command(&self, last_id: &str) -> Result<Vec<(String, HashMap<String, String>)>, WorkerBrokerError> {
        use redis::streams::{StreamReadOptions, StreamReadReply};
        let mut con = self.conn().await?;
        let opts = StreamReadOptions::default().count(10).block(5_000);
        let reply: StreamReadReply = con
            .xread_options(&[keys::command_stream(&self.worker_id)], &[last_id], &opts)
            .await?;
        let mut out = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let mut fields = HashMap::new();
                for (k, v) in entry.map {
                    if let redis::Value::BulkString(b) = v {
                        fields.insert(k, String::from_utf8_lossy(&b).to_string());
                    }
                }
                out.push((entry.id, fields));
            }
        }
        Ok(out)
    }
}

async fn with_retry<F, Fut>(max_attempts: u32, base: Duration, mut f: F) -> Result<(), WorkerBrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), WorkerBrokerError>>,
{
    let mut attempt = 0;
    let mut backoff = base;
    loop {
        attempt += 1;
        match f().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "redis operation failed, retrying with backoff");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        }
    }
}
