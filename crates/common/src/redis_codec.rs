//! Job/worker record <-> Redis hash field codec (§3, §4.1).
//!
//! Neither this module nor the rest of `jobmesh-common` opens a Redis
//! connection; it only defines how entities are shaped into the field names
//! the broker's Lua scripts (`jobmesh-common::scripts`) read and write, so
//! `jobmesh-hub` and `jobmesh-worker` stay byte-for-byte compatible without
//! depending on each other.

use crate::error::{JobMeshError, Result};
use crate::model::{Job, JobRequirements, JobStatus, WorkerCapabilities, WorkerRecord, WorkerStatus};
use std::collections::HashMap;

fn opt(s: Option<&str>) -> String {
    s.unwrap_or("").to_string()
}

fn parse_opt(m: &HashMap<String, String>, field: &str) -> Option<String> {
    m.get(field).filter(|s| !s.is_empty()).cloned()
}

fn status_to_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Assigned => "assigned",
        JobStatus::InProgress => "in_progress",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Timeout => "timeout",
    }
}

fn status_from_str(s: &str) -> Result<JobStatus> {
    Ok(match s {
        "pending" => JobStatus::Pending,
        "assigned" => JobStatus::Assigned,
        "in_progress" => JobStatus::InProgress,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "timeout" => JobStatus::Timeout,
        other => return Err(JobMeshError::InvalidCapabilities(format!("unknown job status {other}"))),
    })
}

impl Job {
    /// Field/value pairs for `HSET job:{id}`. Every field `jobmesh-common`
    /// models is represented individually so the claim/requeue/cancel
    /// scripts can read a single field without deserializing the whole job.
    pub fn to_redis_fields(&self) -> Vec<(String, String)> {
        use base64::Engine;
        vec![
            ("id".into(), self.id.clone()),
            ("service_required".into(), self.service_required.clone()),
            ("priority".into(), self.priority.to_string()),
            ("payload_b64".into(), base64::engine::general_purpose::STANDARD.encode(&self.payload)),
            ("ctx_json".into(), self.ctx.to_string()),
            ("requirements_hardware".into(), serde_json::to_string(&self.requirements.hardware).unwrap_or_default()),
            ("requirements_region".into(), opt(self.requirements.region.as_deref())),
            (
                "requirements_compliance_tags".into(),
                serde_json::to_string(&self.requirements.compliance_tags).unwrap_or_default(),
            ),
            ("customer_id".into(), opt(self.customer_id.as_deref())),
            ("workflow_id".into(), opt(self.workflow_id.as_deref())),
            ("step".into(), self.step.map(|v| v.to_string()).unwrap_or_default()),
            ("total_steps".into(), self.total_steps.map(|v| v.to_string()).unwrap_or_default()),
            ("status".into(), status_to_str(self.status).to_string()),
            ("retry_count".into(), self.retry_count.to_string()),
            ("max_retries".into(), self.max_retries.to_string()),
            ("submitted_at_ms".into(), self.submitted_at_ms.to_string()),
            ("assigned_at_ms".into(), self.assigned_at_ms.map(|v| v.to_string()).unwrap_or_default()),
            ("completed_at_ms".into(), self.completed_at_ms.map(|v| v.to_string()).unwrap_or_default()),
            ("assigned_worker".into(), opt(self.assigned_worker.as_deref())),
            ("last_error".into(), opt(self.last_error.as_deref())),
        ]
    }

    /// Reconstruct a `Job` from `HGETALL job:{id}`.
    pub fn from_redis_fields(m: &HashMap<String, String>) -> Result<Job> {
        use base64::Engine;
        let get = |f: &str| m.get(f).cloned().unwrap_or_default();
        let id = get("id");
        if id.is_empty() {
            return Err(JobMeshError::JobNotFound("<unknown>".into()));
        }
        let payload = base64::engine::general_purpose::STANDARD
            .decode(get("payload_b64"))
            .unwrap_or_default();
        let ctx = serde_json::from_str(&get("ctx_json")).unwrap_or(serde_json::json!({}));
        let requirements = JobRequirements {
            hardware: serde_json::from_str(&get("requirements_hardware")).unwrap_or_default(),
            region: parse_opt(m, "requirements_region"),
            compliance_tags: serde_json::from_str(&get("requirements_compliance_tags")).unwrap_or_default(),
        };
        Ok(Job {
            id,
            service_required: get("service_required"),
            priority: get("priority").parse().unwrap_or(0),
            payload,
            ctx,
            requirements,
            customer_id: parse_opt(m, "customer_id"),
            workflow_id: parse_opt(m, "workflow_id"),
            step: parse_opt(m, "step").and_then(|v| v.parse().ok()),
            total_steps: parse_opt(m, "total_steps").and_then(|v| v.parse().ok()),
            status: status_from_str(&get("status"))?,
            retry_count: get("retry_count").parse().unwrap_or(0),
            max_retries: get("max_retries").parse().unwrap_or(3),
            submitted_at_ms: get("submitted_at_ms").parse().unwrap_or(0),
            assigned_at_ms: parse_opt(m, "assigned_at_ms").and_then(|v| v.parse().ok()),
            completed_at_ms: parse_opt(m, "completed_at_ms").and_then(|v| v.parse().ok()),
            assigned_worker: parse_opt(m, "assigned_worker"),
            last_error: parse_opt(m, "last_error"),
        })
    }
}

fn worker_status_to_str(s: WorkerStatus) -> &'static str {
    match s {
        WorkerStatus::Initializing => "initializing",
        WorkerStatus::Idle => "idle",
        WorkerStatus::Busy => "busy",
        WorkerStatus::Error => "error",
        WorkerStatus::Offline => "offline",
    }
}

fn worker_status_from_str(s: &str) -> WorkerStatus {
    match s {
        "idle" => WorkerStatus::Idle,
        "busy" => WorkerStatus::Busy,
        "error" => WorkerStatus::Error,
        "offline" => WorkerStatus::Offline,
        _ => WorkerStatus::Initializing,
    }
}

impl WorkerRecord {
    /// Field/value pairs for `HSET worker:{id}` (§4.1).
    pub fn to_redis_fields(&self) -> Vec<(String, String)> {
        vec![
            ("worker_id".into(), self.worker_id.clone()),
            ("machine_id".into(), self.machine_id.clone()),
            ("status".into(), worker_status_to_str(self.status).to_string()),
            ("capabilities_json".into(), serde_json::to_string(&self.capabilities).unwrap_or_default()),
            ("current_job".into(), opt(self.current_job.as_deref())),
            ("last_heartbeat_ms".into(), self.last_heartbeat_ms.to_string()),
            ("jobs_processed".into(), self.jobs_processed.to_string()),
        ]
    }

    pub fn from_redis_fields(m: &HashMap<String, String>) -> Result<WorkerRecord> {
        let get = |f: &str| m.get(f).cloned().unwrap_or_default();
        let worker_id = get("worker_id");
        if worker_id.is_empty() {
            return Err(JobMeshError::WorkerNotFound("<unknown>".into()));
        }
        let capabilities: WorkerCapabilities =
            serde_json::from_str(&get("capabilities_json")).unwrap_or_default();
        Ok(WorkerRecord {
            worker_id,
            machine_id: get("machine_id"),
            status: worker_status_from_str(&get("status")),
            capabilities,
            current_job: parse_opt(m, "current_job"),
            last_heartbeat_ms: get("last_heartbeat_ms").parse().unwrap_or(0),
            jobs_processed: get("jobs_processed").parse().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobRequirements;

    fn sample() -> Job {
        Job {
            id: "j1".into(),
            service_required: "rest_echo".into(),
            priority: 50,
            payload: b"hello".to_vec(),
            ctx: serde_json::json!({"workflow_context": {"retry_attempt": 1}}),
            requirements: JobRequirements { region: Some("us".into()), ..Default::default() },
            customer_id: Some("cust-1".into()),
            workflow_id: Some("wf-1".into()),
            step: Some(2),
            total_steps: Some(5),
            status: JobStatus::Pending,
            retry_count: 1,
            max_retries: 3,
            submitted_at_ms: 1000,
            assigned_at_ms: None,
            completed_at_ms: None,
            assigned_worker: None,
            last_error: None,
        }
    }

    #[test]
    fn round_trips_through_redis_fields() {
        let job = sample();
        let fields: HashMap<String, String> = job.to_redis_fields().into_iter().collect();
        let back = Job::from_redis_fields(&fields).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.payload, job.payload);
        assert_eq!(back.ctx, job.ctx);
        assert_eq!(back.requirements.region, job.requirements.region);
        assert_eq!(back.customer_id, job.customer_id);
        assert_eq!(back.step, job.step);
    }

    #[test]
    fn missing_id_is_job_not_found() {
        let m = HashMap::new();
        assert!(Job::from_redis_fields(&m).is_err());
    }
}
