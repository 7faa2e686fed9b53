//! Job broker primitives owned by the hub process (§4.2): submission and
//! cancellation, the two operations that only ever originate from the HTTP
//! API / legacy WebSocket surface.
//!
//! `RequestJob`/`UpdateProgress`/`Complete`/`Fail` are the other half of
//! §4.2's interface, but per §3/§5 ("all cross-component communication is
//! through Redis — no in-process references across components") a worker
//! process must keep claiming and completing jobs even if the hub process
//! is down or restarting. Those four operations are therefore implemented
//! directly against Redis from `jobmesh-worker::broker`, sharing the exact
//! same `jobmesh_common::scripts` Lua source as this module so the
//! atomicity contract never forks into two copies (see DESIGN.md).

use jobmesh_common::keys;
use jobmesh_common::model::{Job, JobStatus};
use jobmesh_common::scripts;
use redis::AsyncCommands;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    JobMesh(#[from] jobmesh_common::JobMeshError),
}

pub struct Broker {
    client: redis::Client,
}

impl Broker {
    pub fn new(client: redis::Client) -> Self {
        Broker { client }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// `Submit(job) -> job_id` (§4.2). Writes the job hash then pushes it
    /// onto the pending sorted set; a reader can never observe a pending-set
    /// entry without a backing hash because the hash is written first.
    pub async fn submit(&self, mut job: Job, now_ms: i64) -> Result<String, BrokerError> {
        let mut con = self.conn().await?;
        job.status = JobStatus::Pending;
        job.submitted_at_ms = now_ms;
        let fields = job.to_redis_fields();
        let _: () = con.hset_multiple(keys::job_key(&job.id), &fields).await?;
        let score = keys::pending_score(job.priority, now_ms);
        let _: () = con.zadd(keys::PENDING_QUEUE, &job.id, score).await?;
        Ok(job.id)
    }

    /// Position (1-indexed) of a job in the pending queue, or `None` if it
    /// isn't pending (already claimed, or doesn't exist).
    pub async fn pending_position(&self, job_id: &str) -> Result<Option<u64>, BrokerError> {
        let mut con = self.conn().await?;
        let rank: Option<u64> = con.zrank(keys::PENDING_QUEUE, job_id).await?;
        Ok(rank.map(|r| r + 1))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, BrokerError> {
        let mut con = self.conn().await?;
        let fields: HashMap<String, String> = con.hgetall(keys::job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_redis_fields(&fields)?))
    }

    /// `Cancel(job_id, reason)` (§4.2). Removes the job from the pending
    /// queue if present, marks it cancelled, and — if it was already
    /// assigned — appends a `cancel` command to the owning worker's command
    /// stream so the worker can propagate the cancellation to its connector.
    pub async fn cancel(&self, job_id: &str, now_ms: i64) -> Result<bool, BrokerError> {
        let mut con = self.conn().await?;
        let script = redis::Script::new(scripts::CANCEL_JOB);
        let prior_status: redis::Value = script
            .key(keys::PENDING_QUEUE)
            .key(keys::job_key(job_id))
            .arg(job_id)
            .invoke_async(&mut con)
            .await?;

        let prior_status = match prior_status {
            redis::Value::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
            redis::Value::SimpleString(s) => s,
            _ => return Ok(false),
        };

        if matches!(prior_status.as_str(), "assigned" | "in_progress") {
            if let Some(job) = self.get_job(job_id).await? {
                if let Some(worker_id) = job.assigned_worker {
                    let _: String = con
                        .xadd(
                            keys::command_stream(&worker_id),
                            "*",
                            &[("action", "cancel"), ("job_id", job_id), ("ts", &now_ms.to_string())],
                        )
                        .await?;
                }
            }
        }
        Ok(true)
    }

    /// Recover a job from a stale worker's active set back onto the pending
    /// queue (used by the sweeper, §4.3 "Heartbeat"). Reuses the requeue
    /// script so the movement stays atomic with the same shape a worker-side
    /// retry requeue uses.
    pub async fn recover_stale_job(&self, worker_id: &str, job_id: &str, now_ms: i64) -> Result<bool, BrokerError> {
        let mut con = self.conn().await?;
        let job = match self.get_job(job_id).await? {
            Some(j) => j,
            None => return Ok(false),
        };
        let score = keys::pending_score(job.priority, now_ms);
        let script = redis::Script::new(scripts::REQUEUE_JOB);
        let ok: bool = script
            .key(keys::PENDING_QUEUE)
            .key(keys::job_key(job_id))
            .key(keys::active_set_key(worker_id))
            .arg(job_id)
            .arg(score)
            .arg(now_ms)
            .invoke_async(&mut con)
            .await?;
        Ok(ok)
    }

    pub async fn active_job_ids(&self, worker_id: &str) -> Result<Vec<String>, BrokerError> {
        let mut con = self.conn().await?;
        let m: HashMap<String, String> = con.hgetall(keys::active_set_key(worker_id)).await?;
        Ok(m.into_keys().collect())
    }

    pub async fn registered_worker_ids(&self) -> Result<Vec<String>, BrokerError> {
        let mut con = self.conn().await?;
        Ok(con.smembers(keys::WORKERS_INDEX).await?)
    }

    pub async fn worker_heartbeat_ms(&self, worker_id: &str) -> Result<Option<i64>, BrokerError> {
        let mut con = self.conn().await?;
        let v: Option<String> = con.hget(keys::worker_key(worker_id), "last_heartbeat_ms").await?;
        Ok(v.and_then(|s| s.parse().ok()))
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), BrokerError> {
        let mut con = self.conn().await?;
        let _: () = con.srem(keys::WORKERS_INDEX, worker_id).await?;
        let _: () = con.hset(keys::worker_key(worker_id), "status", "offline").await?;
        Ok(())
    }
}
