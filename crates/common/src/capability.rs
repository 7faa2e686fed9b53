//! Capability matching rules (§4.2).
//!
//! The broker's atomic claim runs this logic server-side inside a Lua
//! script (see `jobmesh_common::scripts::CLAIM_JOB`), since atomicity
//! requires the match-and-claim to happen in one round trip. This module is
//! the Rust-side reference implementation of the identical rules (a)-(e):
//! unit-tested here in isolation, and used by `jobmesh-worker::broker` as a
//! post-claim cross-check so a divergence between the Lua and Rust
//! implementations surfaces as a warning instead of silently granting a job
//! a worker can't actually honor.

use crate::model::{Job, WorkerCapabilities};
use serde_json::Value;

fn hardware_satisfies(required: &Value, available: &Value) -> bool {
    match (required, available) {
        (Value::Number(req), Value::Number(avail)) => match (req.as_f64(), avail.as_f64()) {
            (Some(r), Some(a)) => a >= r,
            _ => false,
        },
        (Value::String(req), Value::String(avail)) => req == avail,
        _ => required == available,
    }
}

/// Whether `worker` may claim `job`, per the capability matching rules
/// (a)-(e) enumerated in §4.2.
pub fn matches(job: &Job, worker: &WorkerCapabilities) -> bool {
    // (a) service match
    if !worker.services.iter().any(|s| s == &job.service_required) {
        return false;
    }

    // (b) hardware requirements
    for (key, required) in &job.requirements.hardware {
        match worker.hardware.get(key) {
            Some(available) if hardware_satisfies(required, available) => {}
            _ => return false,
        }
    }

    // (c) customer isolation
    if !worker.isolation.accepts(job.customer_id.as_deref()) {
        return false;
    }

    // (d) region/compliance tags must be a subset of worker's tags
    if let Some(region) = &job.requirements.region {
        if worker.region.as_deref() != Some(region.as_str()) {
            return false;
        }
    }
    if !job
        .requirements
        .compliance_tags
        .iter()
        .all(|t| worker.tags.iter().any(|wt| wt == t))
    {
        return false;
    }

    // (e) single-job invariant
    if worker.concurrent_jobs != 1 {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IsolationPolicy, JobRequirements, JobStatus};
    use std::collections::HashMap;

    fn base_job() -> Job {
        Job {
            id: "j1".into(),
            service_required: "rest_echo".into(),
            priority: 50,
            payload: vec![],
            ctx: serde_json::json!({}),
            requirements: JobRequirements::default(),
            customer_id: None,
            workflow_id: None,
            step: None,
            total_steps: None,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            submitted_at_ms: 0,
            assigned_at_ms: None,
            completed_at_ms: None,
            assigned_worker: None,
            last_error: None,
        }
    }

    fn base_worker() -> WorkerCapabilities {
        WorkerCapabilities {
            services: vec!["rest_echo".into()],
            hardware: HashMap::new(),
            models: vec![],
            isolation: IsolationPolicy::None,
            concurrent_jobs: 1,
            region: None,
            cost_tier: None,
            tags: vec![],
        }
    }

    #[test]
    fn service_mismatch_rejects() {
        let job = base_job();
        let mut worker = base_worker();
        worker.services = vec!["other".into()];
        assert!(!matches(&job, &worker));
    }

    #[test]
    fn hardware_numeric_uses_gte() {
        let mut job = base_job();
        job.requirements.hardware.insert("vram_gb".into(), serde_json::json!(8));
        let mut worker = base_worker();
        worker.hardware.insert("vram_gb".into(), serde_json::json!(16));
        assert!(matches(&job, &worker));

        worker.hardware.insert("vram_gb".into(), serde_json::json!(4));
        assert!(!matches(&job, &worker));
    }

    #[test]
    fn strict_isolation_requires_allowlist_membership() {
        let mut job = base_job();
        job.customer_id = Some("cust-1".into());
        let mut worker = base_worker();
        worker.isolation = IsolationPolicy::Strict { allowed: vec!["cust-2".into()], denied: vec![] };
        assert!(!matches(&job, &worker));

        worker.isolation = IsolationPolicy::Strict { allowed: vec!["cust-1".into()], denied: vec![] };
        assert!(matches(&job, &worker));
    }

    #[test]
    fn loose_isolation_only_checks_denylist() {
        let mut job = base_job();
        job.customer_id = Some("cust-1".into());
        let mut worker = base_worker();
        worker.isolation = IsolationPolicy::Loose { denied: vec!["cust-1".into()] };
        assert!(!matches(&job, &worker));

        worker.isolation = IsolationPolicy::Loose { denied: vec!["cust-2".into()] };
        assert!(matches(&job, &worker));
    }

    #[test]
    fn concurrent_jobs_must_be_one() {
        let job = base_job();
        let mut worker = base_worker();
        worker.concurrent_jobs = 2;
        assert!(!matches(&job, &worker));
    }

    #[test]
    fn compliance_tags_must_be_subset() {
        let mut job = base_job();
        job.requirements.compliance_tags = vec!["hipaa".into()];
        let mut worker = base_worker();
        assert!(!matches(&job, &worker));
        worker.tags = vec!["hipaa".into(), "soc2".into()];
        assert!(matches(&job, &worker));
    }
}
