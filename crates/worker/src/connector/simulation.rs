//! Simulation connector: a dependency-free stand-in registered under the
//! `simulation` service type. The manager falls back to it for any
//! `service_required` ending in `-sim` or containing `sim` when no literal
//! match is registered (§4.3 step 4), and it's useful on its own for
//! exercising the worker runtime without a live backend.

use crate::connector::base::BaseConnector;
use crate::connector::{Connector, ConnectorError, HealthCheckOutcome, JobOutcome, ProgressSender, ProgressUpdate};
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, Job, ProtocolKind};
use std::time::Duration;

pub struct SimulationConnector {
    base: BaseConnector,
    step_delay: Duration,
}

impl SimulationConnector {
    pub fn new(connector_id: String, redis: redis::Client, step_delay: Duration) -> Self {
        SimulationConnector {
            base: BaseConnector::new(connector_id, "simulation".to_string(), ProtocolKind::RestSync, redis),
            step_delay,
        }
    }
}

#[async_trait::async_trait]
impl Connector for SimulationConnector {
    fn connector_id(&self) -> &str {
        self.base.connector_id()
    }

    fn service_type(&self) -> &str {
        self.base.service_type()
    }

    fn protocol(&self) -> ProtocolKind {
        self.base.protocol()
    }

    async fn initialize(&self) -> Result<(), ConnectorError> {
        self.base.set_status(ConnectorStatus::Idle, None).await;
        Ok(())
    }

    async fn cleanup(&self) {
        self.base.set_status(ConnectorStatus::Offline, None).await;
    }

    async fn check_health(&self) -> bool {
        self.base.record_check(true).await;
        true
    }

    async fn get_available_models(&self) -> Vec<String> {
        vec!["simulation-v1".to_string()]
    }

    fn can_process_job(&self, job: &Job) -> bool {
        let s = job.service_required.to_lowercase();
        s.ends_with("-sim") || s.contains("sim")
    }

    async fn process_job(&self, job: &Job, progress: ProgressSender) -> Result<JobOutcome, ConnectorError> {
        self.base.set_status(ConnectorStatus::Active, None).await;
        for pct in [25u8, 50, 75, 100] {
            tokio::time::sleep(self.step_delay).await;
            let _ = progress.send(ProgressUpdate { progress: pct, message: Some(format!("simulated step {pct}%")) }).await;
        }
        self.base.set_status(ConnectorStatus::Idle, None).await;
        Ok(JobOutcome {
            raw_request: Some(serde_json::json!({ "job_id": job.id, "simulated": true })),
            raw_response: Some(serde_json::json!({ "status": "ok", "simulated": true })),
        })
    }

    async fn cancel_job(&self, _job_id: &str) {}

    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    fn status_report(&self) -> ConnectorStatusReport {
        self.base.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(service_required: &str) -> Job {
        Job {
            id: "j1".to_string(),
            service_required: service_required.to_string(),
            priority: 0,
            payload: Vec::new(),
            ctx: serde_json::Value::Null,
            requirements: Default::default(),
            customer_id: None,
            workflow_id: None,
            step: None,
            total_steps: None,
            status: jobmesh_common::model::JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            submitted_at_ms: 0,
            assigned_at_ms: None,
            completed_at_ms: None,
            assigned_worker: None,
            last_error: None,
        }
    }

    #[test]
    fn matches_sim_suffix_and_substring() {
        let redis = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = SimulationConnector::new("sim-1".to_string(), redis, Duration::from_millis(1));
        assert!(conn.can_process_job(&job("comfyui-sim")));
        assert!(conn.can_process_job(&job("sim-text-gen")));
        assert!(!conn.can_process_job(&job("openai")));
    }
}
