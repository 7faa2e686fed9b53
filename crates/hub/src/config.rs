//! Hub process configuration, read once at startup (§6, §9 "explicit Context").

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub http_addr: String,
    pub claim_max_scan: usize,
    pub stale_worker_heartbeat_misses: u32,
    pub sweep_interval: Duration,
    pub webhook_max_attempts: u32,
    pub webhook_retry_base: Duration,
    pub sse_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let redis_url = std::env::var("HUB_REDIS_URL").map_err(|_| "HUB_REDIS_URL is required".to_string())?;
        Ok(Config {
            redis_url,
            http_addr: std::env::var("HUB_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            claim_max_scan: env_usize("HUB_CLAIM_MAX_SCAN", 500),
            stale_worker_heartbeat_misses: env_u32("HUB_STALE_WORKER_MISSES", 3),
            sweep_interval: Duration::from_secs(env_u64("HUB_SWEEP_INTERVAL_SECS", 10)),
            webhook_max_attempts: env_u32("HUB_WEBHOOK_MAX_ATTEMPTS", 5),
            webhook_retry_base: Duration::from_millis(env_u64("HUB_WEBHOOK_RETRY_BASE_MS", 1000)),
            sse_queue_capacity: env_usize("HUB_SSE_QUEUE_CAPACITY", 256),
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
