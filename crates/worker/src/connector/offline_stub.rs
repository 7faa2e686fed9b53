//! Offline stub connector (§4.4 graceful degradation): registered in place
//! of a connector whose `Initialize()` failed. Always reports unhealthy and
//! refuses jobs, but keeps the service-type capability visible as
//! present-but-inactive rather than silently dropping it — capability
//! semantics must stay stable across restarts.

use crate::connector::base::BaseConnector;
use crate::connector::{Connector, ConnectorError, HealthCheckOutcome, JobOutcome, ProgressSender};
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, Job, ProtocolKind};

pub struct OfflineStubConnector {
    base: BaseConnector,
}

impl OfflineStubConnector {
    pub async fn new(connector_id: String, service_type: String, redis: redis::Client, init_error: String) -> Self {
        let base = BaseConnector::new(connector_id, service_type, ProtocolKind::RestSync, redis);
        base.set_status(ConnectorStatus::Error, Some(init_error)).await;
        OfflineStubConnector { base }
    }
}

#[async_trait::async_trait]
impl Connector for OfflineStubConnector {
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
        Ok(())
    }

    async fn cleanup(&self) {}

    async fn check_health(&self) -> bool {
        false
    }

    async fn get_available_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn can_process_job(&self, _job: &Job) -> bool {
        false
    }

    async fn process_job(&self, _job: &Job, _progress: ProgressSender) -> Result<JobOutcome, ConnectorError> {
        Err(ConnectorError::new("connector is offline (initialize failed)"))
    }

    async fn cancel_job(&self, _job_id: &str) {}

    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    fn status_report(&self) -> ConnectorStatusReport {
        self.base.report()
    }
}
