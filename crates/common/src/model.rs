//! Shared data model (jobs, workers, connectors, progress, attestations).
//!
//! These types are the wire format for every Redis hash/stream entry and
//! every HTTP/SSE payload in the system; keep them serde-stable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// JOB
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

/// Hardware/capability requirements a job places on a candidate worker.
///
/// Numeric fields are compared `>=` against the worker's advertised
/// hardware; string fields by equality (§4.2).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct JobRequirements {
    #[serde(default)]
    pub hardware: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub id: String,
    pub service_required: String,
    /// Higher = sooner.
    pub priority: i64,
    /// Opaque payload bytes; provider-specific shape lives inside connectors.
    pub payload: Vec<u8>,
    /// Metadata mapping; may carry `workflow_context.retry_attempt` (§4.3/§9).
    #[serde(default)]
    pub ctx: serde_json::Value,
    #[serde(default)]
    pub requirements: JobRequirements,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub submitted_at_ms: i64,
    #[serde(default)]
    pub assigned_at_ms: Option<i64>,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

// =============================================================================
// WORKER
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Offline,
}

/// Customer isolation policy a worker enforces when matching jobs (§4.2c).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IsolationPolicy {
    Strict {
        allowed: Vec<String>,
        #[serde(default)]
        denied: Vec<String>,
    },
    Loose {
        #[serde(default)]
        denied: Vec<String>,
    },
    None,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        IsolationPolicy::None
    }
}

impl IsolationPolicy {
    /// Whether a job from `customer_id` (if any) may be claimed under this policy.
    pub fn accepts(&self, customer_id: Option<&str>) -> bool {
        match self {
            IsolationPolicy::None => true,
            IsolationPolicy::Loose { denied } => match customer_id {
                Some(c) => !denied.iter().any(|d| d == c),
                None => true,
            },
            IsolationPolicy::Strict { allowed, denied } => match customer_id {
                Some(c) => allowed.iter().any(|a| a == c) && !denied.iter().any(|d| d == c),
                None => false,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WorkerCapabilities {
    pub services: Vec<String>,
    #[serde(default)]
    pub hardware: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub isolation: IsolationPolicy,
    /// MUST be 1 (§4.2e / §4.3 single-job invariant).
    #[serde(default = "default_concurrent_jobs")]
    pub concurrent_jobs: u32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub cost_tier: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_concurrent_jobs() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub machine_id: String,
    pub status: WorkerStatus,
    pub capabilities: WorkerCapabilities,
    pub current_job: Option<String>,
    pub last_heartbeat_ms: i64,
    pub jobs_processed: u64,
}

// =============================================================================
// CONNECTOR
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    RestSync,
    RestAsync,
    WebSocket,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Starting,
    WaitingForService,
    Connecting,
    Idle,
    Active,
    Error,
    Offline,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectorStatusReport {
    pub connector_id: String,
    pub service_type: String,
    pub protocol: ProtocolKind,
    pub status: ConnectorStatus,
    pub last_error: Option<String>,
    pub last_check_ms: i64,
}

// =============================================================================
// PROGRESS
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: String,
    /// 0-100.
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    pub worker_id: String,
    pub ts_ms: i64,
    /// Present only on the final entry a worker writes for a job: one of
    /// `completed | failed | cancelled`. Lets the event bridge (§4.6) turn a
    /// stream entry into the right terminal SSE/WS event without a second
    /// round trip to read the job hash.
    #[serde(default)]
    pub terminal_status: Option<String>,
    /// Set only on the first entry a worker writes after claiming a job, so
    /// the event bridge can emit `job_started` (§6) from a reachable signal
    /// instead of guessing from `progress == 0` (which no connector ever
    /// sends).
    #[serde(default)]
    pub started: bool,
}

// =============================================================================
// ATTESTATION
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttestationKind {
    Completion,
    FailureRetry,
    FailurePermanent,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Attestation {
    pub kind: AttestationKind,
    pub job_id: String,
    pub worker_id: String,
    pub machine_id: String,
    pub worker_version: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    pub retry_count: u32,
    pub will_retry: bool,
    pub max_retries: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_type: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_description: Option<String>,
    pub attestation_created_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    #[serde(default)]
    pub failed_at_ms: Option<i64>,
    #[serde(default)]
    pub raw_request: Option<serde_json::Value>,
    #[serde(default)]
    pub raw_response: Option<serde_json::Value>,
}

// =============================================================================
// WEBHOOK SUBSCRIPTION
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WebhookFilter {
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub machine_id_prefix: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub filter: WebhookFilter,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_webhook_max_attempts() -> u32 {
    5
}
