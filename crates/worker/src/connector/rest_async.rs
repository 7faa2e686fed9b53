//! REST-async / polling connector base (§4.4): submit a job to one endpoint,
//! obtain a backend job id, then poll a status endpoint until the backend
//! reports complete or failed. Includes semantic refusal detection: an
//! HTTP-200 response whose text matches a refusal pattern becomes a
//! `GENERATION_REFUSAL` failure rather than a success.

use super::{AuthScheme, ConnectorError, JobOutcome, ProgressSender, ProgressUpdate, RetryPolicy};
use crate::connector::base::BaseConnector;
use crate::connector::{Connector, HealthCheckOutcome};
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, Job, ProtocolKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Case-insensitive refusal phrases (§4.4). A match on a nominally
/// successful response turns it into a `GENERATION_REFUSAL` failure.
static REFUSAL_SET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)cannot generate|unable to create|policy violation|inappropriate|not allowed|refused|declined|moderation_blocked|safety system",
    )
    .expect("refusal regex is a compile-time constant")
});

/// Matches a provider-assigned request id embedded in refusal text, e.g.
/// OpenAI-style `wfr_0199...` (§4.4).
static REQUEST_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"wfr_[A-Za-z0-9]+").expect("request id regex is a compile-time constant"));

/// Poll outcome a subclass reports back after inspecting one status
/// response (§4.4: "completion detection, and result parsing").
pub enum PollOutcome {
    Pending { progress: Option<u8>, message: Option<String> },
    Complete(JobOutcome),
    Failed(ConnectorError),
}

#[async_trait::async_trait]
pub trait RestAsyncOps: Send + Sync {
    fn submit_path(&self, job: &Job) -> String;
    fn status_path(&self, backend_job_id: &str) -> String;

    fn build_submit_payload(&self, job: &Job) -> Result<serde_json::Value, ConnectorError>;

    /// Extract the backend's own job id from the submit response.
    fn extract_backend_job_id(&self, submit_response: &serde_json::Value) -> Result<String, ConnectorError>;

    /// Inspect one status-poll response.
    fn interpret_status(&self, status_response: &serde_json::Value, job: &Job) -> PollOutcome;

    fn can_process_job(&self, job: &Job) -> bool;
}

pub struct RestAsyncConnector {
    base: BaseConnector,
    client: reqwest::Client,
    base_url: String,
    auth: AuthScheme,
    timeout: Duration,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_poll_interval: Duration,
    ops: Box<dyn RestAsyncOps>,
    in_flight: Mutex<Option<Arc<tokio_util::sync::CancellationToken>>>,
}

impl RestAsyncConnector {
    pub fn new(
        connector_id: String,
        service_type: String,
        redis: redis::Client,
        base_url: String,
        auth: AuthScheme,
        timeout: Duration,
        retry: RetryPolicy,
        poll_interval: Duration,
        max_poll_interval: Duration,
        ops: Box<dyn RestAsyncOps>,
    ) -> Self {
        RestAsyncConnector {
            base: BaseConnector::new(connector_id, service_type, ProtocolKind::RestAsync, redis),
            client: reqwest::Client::new(),
            base_url,
            auth,
            timeout,
            retry,
            poll_interval,
            max_poll_interval,
            ops,
            in_flight: Mutex::new(None),
        }
    }

    async fn post(&self, path: &str, payload: &serde_json::Value) -> Result<serde_json::Value, ConnectorError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.post(&url).timeout(self.timeout).json(payload);
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
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, ConnectorError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.get(&url).timeout(self.timeout);
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
        Ok(body)
    }

    /// Detects a refusal hidden inside an otherwise-200 status response
    /// (§4.4 "semantic failure detection").
    fn detect_refusal(text: &str) -> Option<ConnectorError> {
        if !REFUSAL_SET.is_match(text) {
            return None;
        }
        let trimmed = text.trim();
        let request_id = REQUEST_ID_PATTERN.find(trimmed).map(|m| m.as_str().to_string());
        let mut message = format!("generation refused: {trimmed}");
        if let Some(id) = request_id {
            message.push_str(&format!(" (request_id={id})"));
        }
        Some(ConnectorError::new(message).with_raw_response(trimmed.to_string()))
    }
}

#[async_trait::async_trait]
impl Connector for RestAsyncConnector {
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
        if self.check_health().await {
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
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.base.record_check(healthy).await;
        healthy
    }

    async fn get_available_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn can_process_job(&self, job: &Job) -> bool {
        self.ops.can_process_job(job)
    }

    async fn process_job(&self, job: &Job, progress: ProgressSender) -> Result<JobOutcome, ConnectorError> {
        self.base.set_status(ConnectorStatus::Active, None).await;
        let token = Arc::new(tokio_util::sync::CancellationToken::new());
        *self.in_flight.lock().await = Some(token.clone());

        let outcome = self.process_job_inner(job, progress, token.clone()).await;

        *self.in_flight.lock().await = None;
        self.base.set_status(ConnectorStatus::Idle, None).await;
        outcome
    }

    async fn cancel_job(&self, _job_id: &str) {
        if let Some(token) = self.in_flight.lock().await.as_ref() {
            token.cancel();
        }
    }

    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    fn status_report(&self) -> ConnectorStatusReport {
        self.base.report()
    }
}

impl RestAsyncConnector {
    async fn process_job_inner(
        &self,
        job: &Job,
        progress: ProgressSender,
        cancel: Arc<tokio_util::sync::CancellationToken>,
    ) -> Result<JobOutcome, ConnectorError> {
        let payload = self.ops.build_submit_payload(job)?;
        let submit_response = self.submit_with_retry(job, &payload).await?;
        let backend_job_id = self.ops.extract_backend_job_id(&submit_response)?;

        let mut interval = self.poll_interval;
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectorError::new("job cancelled"));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectorError::new("job cancelled")),
                _ = tokio::time::sleep(interval) => {}
            }

            let status_response = self.get(&self.ops.status_path(&backend_job_id)).await?;

            if let Some(text) = status_response.as_str().or_else(|| status_response.get("message").and_then(|m| m.as_str())) {
                if let Some(refusal) = Self::detect_refusal(text) {
                    warn!(job_id = %job.id, backend_job_id, "semantic refusal detected in poll response");
                    return Err(refusal);
                }
            }

            match self.ops.interpret_status(&status_response, job) {
                PollOutcome::Pending { progress: pct, message } => {
                    if let Some(pct) = pct {
                        let _ = progress.send(ProgressUpdate { progress: pct, message: message.clone() }).await;
                    }
                    interval = (interval * 2).min(self.max_poll_interval);
                }
                PollOutcome::Complete(outcome) => {
                    let _ = progress.send(ProgressUpdate { progress: 100, message: Some("completed".to_string()) }).await;
                    return Ok(JobOutcome {
                        raw_request: outcome.raw_request.or_else(|| Some(payload.clone())),
                        raw_response: outcome.raw_response.or_else(|| Some(status_response.clone())),
                    });
                }
                PollOutcome::Failed(err) => return Err(err),
            }
        }
    }

    async fn submit_with_retry(&self, job: &Job, payload: &serde_json::Value) -> Result<serde_json::Value, ConnectorError> {
        let mut attempt = 0;
        loop {
            match self.post(&self.ops.submit_path(job), payload).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < self.retry.max_attempts && self.retry.is_transient(e.http_status, e.timeout, false) => {
                    warn!(job_id = %job.id, attempt, error = %e, "submit failed, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
