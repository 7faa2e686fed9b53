use thiserror::Error;

/// Errors shared across the broker, worker, and connector layers.
///
/// Component-specific errors (connector transport failures, Lua script
/// failures) wrap into this at the boundary where they cross into shared
/// code such as attestation writing.
#[derive(Debug, Error)]
pub enum JobMeshError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("invalid capability record: {0}")]
    InvalidCapabilities(String),

    #[error("claim script error: {0}")]
    ClaimScript(String),
}

pub type Result<T> = std::result::Result<T, JobMeshError>;
