//! Protocol connector layer (§4.4): the abstraction that turns a generic
//! `Job` into a call against a specific backend service.
//!
//! `Connector` is the trait every service integration implements; the three
//! protocol bases in `rest_sync`, `rest_async`, and `websocket` each supply a
//! default `ProcessJob`/`CancelJob`/`HealthCheckJob` built on top of shared
//! lifecycle plumbing in `base::BaseConnector`, and defer the
//! service-specific bits to a `ConnectorOps` implementation (composition
//! over inheritance, per §9).

pub mod base;
pub mod manager;
pub mod offline_stub;
pub mod rest_async;
pub mod rest_sync;
pub mod simulation;
pub mod websocket;

use jobmesh_common::classifier::Classification;
#[cfg(test)]
use jobmesh_common::classifier::FailureType;
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, ProtocolKind};
use std::time::Duration;

/// Sent by a connector as it works a job; the worker runtime turns these
/// into `UpdateProgress` calls against the broker (§4.3 step 5).
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: u8,
    pub message: Option<String>,
}

pub type ProgressSender = tokio::sync::mpsc::Sender<ProgressUpdate>;

/// Successful result of `ProcessJob`. The payload is opaque to the worker
/// runtime, mirroring `Job::payload` (§3).
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub raw_request: Option<serde_json::Value>,
    pub raw_response: Option<serde_json::Value>,
}

/// A failed `ProcessJob`/`HealthCheckJob` call, carrying enough context for
/// `jobmesh_common::classifier::classify` to run at the worker runtime layer.
#[derive(Debug, Clone)]
pub struct ConnectorError {
    pub message: String,
    pub http_status: Option<u16>,
    pub timeout: bool,
    pub raw_response: Option<String>,
}

impl ConnectorError {
    pub fn new(message: impl Into<String>) -> Self {
        ConnectorError { message: message.into(), http_status: None, timeout: false, raw_response: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_timeout(mut self) -> Self {
        self.timeout = true;
        self
    }

    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// Classify this error against the shared taxonomy (§4.5).
    pub fn classify(&self, service_type: &str) -> Classification {
        let ctx = jobmesh_common::classifier::ClassifyContext {
            service_type,
            http_status: self.http_status,
            timeout: self.timeout,
            raw_response: self.raw_response.as_deref(),
        };
        jobmesh_common::classifier::classify(&self.message, &ctx)
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConnectorError {}

/// Outcome of an optional `HealthCheckJob` call (§4.3 job health monitor).
#[derive(Debug, Clone)]
pub enum HealthCheckOutcome {
    CompleteJob(JobOutcome),
    FailJob(ConnectorError),
    ReturnToQueue,
    ContinueMonitoring,
}

/// `BaseConnector` contract every connector implements (§4.4).
///
/// Object-safe via `async-trait` so the manager can hold
/// `Arc<dyn Connector>` across heterogeneous protocol implementations.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    fn connector_id(&self) -> &str;
    fn service_type(&self) -> &str;
    fn protocol(&self) -> ProtocolKind;

    /// Idempotent lifecycle hook. Called once at startup and safe to retry.
    async fn initialize(&self) -> Result<(), ConnectorError>;

    /// Idempotent lifecycle hook, called at shutdown.
    async fn cleanup(&self);

    /// Shallow liveness probe of the backend.
    async fn check_health(&self) -> bool;

    /// Best-effort enumeration; empty is allowed.
    async fn get_available_models(&self) -> Vec<String>;

    /// Pre-dispatch affinity check (§4.3 step 4).
    fn can_process_job(&self, job: &jobmesh_common::model::Job) -> bool;

    /// Process one job; not called concurrently per connector instance
    /// (`max_concurrent_jobs` defaults to 1 but is enforced by the caller,
    /// not assumed by the trait — §4.4).
    async fn process_job(
        &self,
        job: &jobmesh_common::model::Job,
        progress: ProgressSender,
    ) -> Result<JobOutcome, ConnectorError>;

    /// Best-effort abort of an in-flight job.
    async fn cancel_job(&self, job_id: &str);

    /// Optional health check for a specific in-flight job, invoked by the
    /// worker's health monitor on activity timeout (§4.3). Connectors
    /// without a meaningful check return `ContinueMonitoring`.
    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    /// Current lifecycle status report, as last written to Redis.
    fn status_report(&self) -> ConnectorStatusReport;
}

/// Shared retry policy for the REST connector bases (§4.4).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            honor_retry_after: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// 5xx, timeouts, connection failures, and 429-with-Retry-After are
    /// retried internally up to `max_attempts` (§4.4 "retry classification
    /// inside connectors").
    pub fn is_transient(&self, status: Option<u16>, timed_out: bool, connection_error: bool) -> bool {
        if timed_out || connection_error {
            return true;
        }
        matches!(status, Some(s) if s >= 500 || s == 429)
    }
}

/// Auth scheme a REST connector attaches to outgoing requests (§4.4).
#[derive(Debug, Clone)]
pub enum AuthScheme {
    ApiKey { header: String, value: String },
    Bearer { token: String },
    Basic { username: String, password: String },
    OAuth { token: String },
    None,
}

impl AuthScheme {
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthScheme::ApiKey { header, value } => builder.header(header.as_str(), value.as_str()),
            AuthScheme::Bearer { token } => builder.bearer_auth(token),
            AuthScheme::Basic { username, password } => builder.basic_auth(username, Some(password)),
            AuthScheme::OAuth { token } => builder.bearer_auth(token),
            AuthScheme::None => builder,
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_status_report(
    connector_id: &str,
    service_type: &str,
    protocol: ProtocolKind,
    status: ConnectorStatus,
) -> ConnectorStatusReport {
    ConnectorStatusReport {
        connector_id: connector_id.to_string(),
        service_type: service_type.to_string(),
        protocol,
        status,
        last_error: None,
        last_check_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_error_classifies_through_shared_taxonomy() {
        let err = ConnectorError::new("invalid api key").with_status(401);
        let classification = err.classify("openai");
        assert_eq!(classification.failure_type, FailureType::AuthError);
        assert_eq!(classification.reason, "invalid_api_key");
    }

    #[test]
    fn retry_policy_backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(1), ..RetryPolicy::default() };
        let delay = policy.delay_for_attempt(10);
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn retry_policy_treats_5xx_429_timeout_and_connection_errors_as_transient() {
        let policy = RetryPolicy::default();
        assert!(policy.is_transient(Some(503), false, false));
        assert!(policy.is_transient(Some(429), false, false));
        assert!(policy.is_transient(None, true, false));
        assert!(policy.is_transient(None, false, true));
        assert!(!policy.is_transient(Some(404), false, false));
    }
}
