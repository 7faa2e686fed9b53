//! Worker process configuration (§6 "Worker configuration"), read once at
//! startup into a typed `Config`, the same "lift scattered `env::var` calls
//! into one place" treatment the hub applies (§9 "explicit Context value").

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub worker_id: String,
    pub machine_id: String,
    /// Parsed `WORKERS=<type>:<count>[,<type>:<count>...]`.
    pub connector_counts: HashMap<String, u32>,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub inactivity_timeout: Duration,
    pub http_addr: String,
    /// Bound on how many pending-queue entries `CLAIM_JOB` scans per call.
    /// Shares `HUB_CLAIM_MAX_SCAN` with the hub so both processes agree on
    /// the same operational tuning knob for the one queue they both touch.
    pub claim_max_scan: usize,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{key} is required"),
            ConfigError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = std::env::var("HUB_REDIS_URL").map_err(|_| ConfigError::Missing("HUB_REDIS_URL"))?;
        let worker_id = std::env::var("WORKER_ID").map_err(|_| ConfigError::Missing("WORKER_ID"))?;
        let machine_id = std::env::var("MACHINE_ID").unwrap_or_else(|_| "unknown".to_string());

        let connector_counts = match std::env::var("WORKERS") {
            Ok(spec) => parse_workers_spec(&spec)?,
            Err(_) => HashMap::new(),
        };

        Ok(Config {
            redis_url,
            worker_id,
            machine_id,
            connector_counts,
            poll_interval: Duration::from_millis(env_u64("WORKER_POLL_INTERVAL_MS", 1000)),
            job_timeout: Duration::from_secs(env_u64("WORKER_JOB_TIMEOUT_MINUTES", 30) * 60),
            heartbeat_interval: Duration::from_secs(env_u64("WORKER_HEARTBEAT_INTERVAL", 30)),
            health_check_interval: Duration::from_secs(env_u64("WORKER_HEALTH_CHECK_INTERVAL_SECS", 30)),
            inactivity_timeout: Duration::from_secs(env_u64("WORKER_INACTIVITY_TIMEOUT_SECS", 30)),
            http_addr: std::env::var("WORKER_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
            claim_max_scan: env_u64("HUB_CLAIM_MAX_SCAN", 500) as usize,
        })
    }
}

/// `WORKERS=comfyui:2,openai:1` → `{"comfyui": 2, "openai": 1}`.
fn parse_workers_spec(spec: &str) -> Result<HashMap<String, u32>, ConfigError> {
    let mut out = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, count) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("malformed WORKERS entry: {entry}")))?;
        let count: u32 = count
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("malformed WORKERS count in: {entry}")))?;
        out.insert(name.to_string(), count);
    }
    Ok(out)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_workers_entries() {
        let out = parse_workers_spec("comfyui:2, openai:1").unwrap();
        assert_eq!(out.get("comfyui"), Some(&2));
        assert_eq!(out.get("openai"), Some(&1));
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_workers_spec("comfyui").is_err());
        assert!(parse_workers_spec("comfyui:notanumber").is_err());
    }
}
