//! Redis key/stream namespace (§4.1).
//!
//! This namespace is a contract: monitors and attestation readers depend on
//! it verbatim, so every key is built through these functions rather than
//! formatted ad hoc at call sites.

pub const PENDING_QUEUE: &str = "jobs:pending";
pub const WORKERS_INDEX: &str = "workers:active";

/// Score for `jobs:pending`: lower sorts sooner. Equal-priority ties break
/// on `submitted_at_ms` (earlier wins) because it's added, not subtracted.
pub fn pending_score(priority: i64, submitted_at_ms: i64) -> f64 {
    (priority as f64) * -1e13 + (submitted_at_ms as f64)
}

pub fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

pub fn active_set_key(worker_id: &str) -> String {
    format!("jobs:active:{worker_id}")
}

pub fn worker_key(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

pub fn progress_stream(job_id: &str) -> String {
    format!("progress:{job_id}")
}

pub fn command_stream(worker_id: &str) -> String {
    format!("commands:{worker_id}")
}

/// Worker completion attestation key.
///
/// Standalone jobs (no workflow) omit the workflow segment.
pub fn completion_key(workflow_id: Option<&str>, job_id: &str, attempt: u32) -> String {
    match workflow_id {
        Some(wf) => format!("worker:completion:workflow-{wf}:job-{job_id}:attempt:{attempt}"),
        None => format!("worker:completion:job-{job_id}:attempt:{attempt}"),
    }
}

pub fn failure_retry_key(workflow_id: Option<&str>, job_id: &str, attempt: u32) -> String {
    match workflow_id {
        Some(wf) => format!("worker:failure:workflow-{wf}:job-{job_id}:attempt:{attempt}"),
        None => format!("worker:failure:job-{job_id}:attempt:{attempt}"),
    }
}

pub fn failure_permanent_key(workflow_id: Option<&str>, job_id: &str) -> String {
    match workflow_id {
        Some(wf) => format!("worker:failure:workflow-{wf}:job-{job_id}:permanent"),
        None => format!("worker:failure:job-{job_id}:permanent"),
    }
}

pub fn workflow_failure_permanent_key(workflow_id: &str) -> String {
    format!("workflow:failure:{workflow_id}:permanent")
}

pub fn connector_status_channel(connector_id: &str) -> String {
    format!("connector_status:{connector_id}")
}

/// Attestation TTLs, seconds. Non-zero per §4.1 ("MUST be non-zero").
pub const RETRY_ATTESTATION_TTL_SECS: i64 = 5 * 60;
pub const PERMANENT_ATTESTATION_TTL_SECS: i64 = 24 * 60 * 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_score_orders_by_priority_then_time() {
        let high = pending_score(100, 1_000);
        let low = pending_score(1, 1_000);
        assert!(high < low, "higher priority must sort first (lower score)");

        let earlier = pending_score(50, 1_000);
        let later = pending_score(50, 2_000);
        assert!(earlier < later, "equal priority: earlier submission wins");
    }

    #[test]
    fn completion_key_omits_workflow_segment_for_standalone_jobs() {
        assert_eq!(completion_key(None, "j1", 1), "worker:completion:job-j1:attempt:1");
        assert_eq!(
            completion_key(Some("wf1"), "j1", 1),
            "worker:completion:workflow-wf1:job-j1:attempt:1"
        );
    }
}
