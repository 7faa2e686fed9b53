//! REST-sync connector base (§4.4): one request, one response, a single
//! `progress=100` event on completion. Subclasses only implement the
//! service-shaped bits via `RestSyncOps`.

use super::{AuthScheme, ConnectorError, JobOutcome, ProgressSender, ProgressUpdate, RetryPolicy};
use crate::connector::base::BaseConnector;
use crate::connector::{Connector, HealthCheckOutcome};
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, Job, ProtocolKind};
use tracing::warn;

/// Service-specific hooks a REST-sync connector subclass implements
/// (§4.4: `BuildRequestPayload`, `ParseResponse`, `ValidateServiceResponse`).
#[async_trait::async_trait]
pub trait RestSyncOps: Send + Sync {
    fn endpoint_path(&self, job: &Job) -> String;

    fn build_request_payload(&self, job: &Job) -> Result<serde_json::Value, ConnectorError>;

    fn parse_response(&self, body: &serde_json::Value, job: &Job) -> Result<JobOutcome, ConnectorError>;

    /// Inspect a successful HTTP response body before `parse_response`
    /// runs, e.g. to catch an embedded `{"error": ...}` shape on HTTP 200.
    fn validate_service_response(&self, body: &serde_json::Value) -> Result<(), ConnectorError> {
        let _ = body;
        Ok(())
    }

    fn can_process_job(&self, job: &Job) -> bool;

    async fn get_available_models(&self, client: &reqwest::Client, base_url: &str) -> Vec<String> {
        let _ = (client, base_url);
        Vec::new()
    }
}

pub struct RestSyncConnector {
    base: BaseConnector,
    client: reqwest::Client,
    base_url: String,
    auth: AuthScheme,
    timeout: std::time::Duration,
    retry: RetryPolicy,
    ops: Box<dyn RestSyncOps>,
}

impl RestSyncConnector {
    pub fn new(
        connector_id: String,
        service_type: String,
        redis: redis::Client,
        base_url: String,
        auth: AuthScheme,
        timeout: std::time::Duration,
        retry: RetryPolicy,
        ops: Box<dyn RestSyncOps>,
    ) -> Self {
        RestSyncConnector {
            base: BaseConnector::new(connector_id, service_type, ProtocolKind::RestSync, redis),
            client: reqwest::Client::new(),
            base_url,
            auth,
            timeout,
            retry,
            ops,
        }
    }

    async fn call_once(&self, job: &Job) -> Result<(serde_json::Value, serde_json::Value), ConnectorError> {
        let payload = self.ops.build_request_payload(job)?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), self.ops.endpoint_path(job));
        let mut builder = self.client.post(&url).timeout(self.timeout).json(&payload);
        builder = self.auth.apply(builder);

        let resp = builder.send().await.map_err(|e| {
            let mut err = ConnectorError::new(format!("request to {url} failed: {e}"));
            if e.is_timeout() {
                err = err.with_timeout();
            }
            err
        })?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            return Err(ConnectorError::new(format!("service returned HTTP {status}"))
                .with_status(status.as_u16())
                .with_raw_response(body.to_string()));
        }

        self.ops.validate_service_response(&body)?;
        Ok((payload, body))
    }
}

#[async_trait::async_trait]
impl Connector for RestSyncConnector {
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
        self.base.set_status(ConnectorStatus::Connecting, None).await;
        let healthy = self.check_health().await;
        if healthy {
            self.base.set_status(ConnectorStatus::Idle, None).await;
            Ok(())
        } else {
            let err = "initial health probe failed".to_string();
            self.base.set_status(ConnectorStatus::Error, Some(err.clone())).await;
            Err(ConnectorError::new(err))
        }
    }

    async fn cleanup(&self) {
        self.base.set_status(ConnectorStatus::Offline, None).await;
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let healthy = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.base.record_check(healthy).await;
        healthy
    }

    async fn get_available_models(&self) -> Vec<String> {
        self.ops.get_available_models(&self.client, &self.base_url).await
    }

    fn can_process_job(&self, job: &Job) -> bool {
        self.ops.can_process_job(job)
    }

    async fn process_job(&self, job: &Job, progress: ProgressSender) -> Result<JobOutcome, ConnectorError> {
        self.base.set_status(ConnectorStatus::Active, None).await;

        let mut attempt = 0;
        let result = loop {
            match self.call_once(job).await {
                Ok((req, body)) => break Ok((req, body)),
                Err(e) if attempt + 1 < self.retry.max_attempts && self.retry.is_transient(e.http_status, e.timeout, false) => {
                    warn!(job_id = %job.id, attempt, error = %e, "rest-sync call failed, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        self.base.set_status(ConnectorStatus::Idle, None).await;

        let (raw_request, raw_response) = result?;
        let outcome = self.ops.parse_response(&raw_response, job)?;
        let _ = progress
            .send(ProgressUpdate { progress: 100, message: Some("completed".to_string()) })
            .await;

        Ok(JobOutcome {
            raw_request: outcome.raw_request.or(Some(raw_request)),
            raw_response: outcome.raw_response.or(Some(raw_response)),
        })
    }

    async fn cancel_job(&self, _job_id: &str) {
        // A REST-sync call is a single blocking request; there is nothing
        // to cancel once it has been sent (§4.4: best-effort abort).
    }

    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    fn status_report(&self) -> ConnectorStatusReport {
        self.base.report()
    }
}
