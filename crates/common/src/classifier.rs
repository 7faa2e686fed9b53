//! Failure classification (§4.5).
//!
//! `classify` is a pure function: same `(message, context)` always yields
//! the same `(type, reason, description)`, never reads wall-clock or global
//! state (§8). It is the single place that knows the two-tier taxonomy.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    GenerationRefusal,
    AuthError,
    RateLimit,
    NetworkError,
    ServiceError,
    Timeout,
    ValidationError,
    ResourceLimit,
    ResponseError,
    SystemError,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::GenerationRefusal => "generation_refusal",
            FailureType::AuthError => "auth_error",
            FailureType::RateLimit => "rate_limit",
            FailureType::NetworkError => "network_error",
            FailureType::ServiceError => "service_error",
            FailureType::Timeout => "timeout",
            FailureType::ValidationError => "validation_error",
            FailureType::ResourceLimit => "resource_limit",
            FailureType::ResponseError => "response_error",
            FailureType::SystemError => "system_error",
        }
    }

    /// Whether a failure of this type is retryable at the job level (§7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureType::NetworkError | FailureType::RateLimit | FailureType::Timeout | FailureType::ServiceError
        )
    }
}

/// Context passed alongside the raw message; HTTP status is consulted
/// before message patterns (§4.5 precedence).
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext<'a> {
    pub service_type: &'a str,
    pub http_status: Option<u16>,
    pub timeout: bool,
    pub raw_response: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub failure_type: FailureType,
    pub reason: &'static str,
    pub description: String,
}

struct Pattern {
    reason: &'static str,
    needles: &'static [&'static str],
}

const REFUSAL_PATTERNS: &[Pattern] = &[
    Pattern { reason: "safety_filter", needles: &["safety system", "safety filter", "moderation_blocked", "moderation blocked"] },
    Pattern { reason: "violence_detected", needles: &["violence detected", "violent content"] },
    Pattern { reason: "copyright_blocker", needles: &["copyright", "dmca"] },
    Pattern { reason: "nsfw_content", needles: &["nsfw", "explicit content", "sexual content"] },
    Pattern { reason: "hate_speech", needles: &["hate speech", "hateful content"] },
    Pattern { reason: "personal_info", needles: &["personal information", "pii detected"] },
    Pattern { reason: "policy_violation", needles: &["policy violation", "cannot generate", "unable to create", "not allowed", "refused", "declined", "inappropriate"] },
];

const AUTH_PATTERNS: &[Pattern] = &[
    Pattern { reason: "invalid_api_key", needles: &["invalid api key", "invalid_api_key", "api key is invalid", "unauthorized"] },
    Pattern { reason: "expired_token", needles: &["token expired", "expired token", "expired_token"] },
    Pattern { reason: "insufficient_permissions", needles: &["insufficient permissions", "forbidden", "access denied"] },
    Pattern { reason: "account_suspended", needles: &["account suspended", "account_suspended", "account disabled"] },
];

const RATE_LIMIT_PATTERNS: &[Pattern] = &[
    Pattern { reason: "requests_per_minute", needles: &["requests per minute", "rate limit", "rate_limit", "too many requests"] },
    Pattern { reason: "tokens_per_minute", needles: &["tokens per minute", "token rate limit"] },
    Pattern { reason: "daily_quota_exceeded", needles: &["daily quota", "quota exceeded", "quota_exceeded"] },
    Pattern { reason: "concurrent_requests", needles: &["concurrent requests", "too many concurrent"] },
];

const NETWORK_PATTERNS: &[Pattern] = &[
    Pattern { reason: "connection_failed", needles: &["connection refused", "connection failed", "connection reset", "econnrefused"] },
    Pattern { reason: "dns_resolution", needles: &["dns resolution", "could not resolve host", "name or service not known"] },
    Pattern { reason: "ssl_certificate", needles: &["ssl certificate", "certificate verify failed", "tls handshake"] },
    Pattern { reason: "proxy_error", needles: &["proxy error", "bad gateway"] },
    Pattern { reason: "network_timeout", needles: &["network timeout", "connect timeout"] },
];

const RESOURCE_PATTERNS: &[Pattern] = &[
    Pattern { reason: "out_of_memory", needles: &["out of memory", "oom", "cuda out of memory"] },
    Pattern { reason: "disk_space_full", needles: &["disk space", "no space left"] },
    Pattern { reason: "gpu_memory_full", needles: &["gpu memory", "vram"] },
    Pattern { reason: "concurrent_limit", needles: &["concurrent limit", "max concurrency"] },
];

const SERVICE_PATTERNS: &[Pattern] = &[
    Pattern { reason: "service_down", needles: &["service down", "service is down"] },
    Pattern { reason: "service_unavailable", needles: &["service unavailable", "unavailable"] },
    Pattern { reason: "maintenance_mode", needles: &["maintenance mode", "under maintenance"] },
    Pattern { reason: "degraded_performance", needles: &["degraded performance", "degraded service"] },
];

const TIMEOUT_PATTERNS: &[Pattern] = &[
    Pattern { reason: "job_timeout", needles: &["job timeout", "job_timeout"] },
    Pattern { reason: "processing_timeout", needles: &["processing timeout", "processing_timeout"] },
    Pattern { reason: "queue_timeout", needles: &["queue timeout", "queue_timeout"] },
    Pattern { reason: "network_timeout", needles: &["timed out", "timeout"] },
];

const VALIDATION_PATTERNS: &[Pattern] = &[
    Pattern { reason: "missing_required_field", needles: &["missing required field", "required field"] },
    Pattern { reason: "invalid_format", needles: &["invalid format", "malformed"] },
    Pattern { reason: "unsupported_operation", needles: &["unsupported operation", "not supported"] },
    Pattern { reason: "model_not_found", needles: &["model not found", "unknown model"] },
    Pattern { reason: "component_error", needles: &["component error", "missing component", "node not found"] },
    Pattern { reason: "invalid_payload", needles: &["invalid payload", "invalid request", "bad request"] },
];

const RESPONSE_PATTERNS: &[Pattern] = &[
    Pattern { reason: "invalid_response_format", needles: &["invalid response format", "unexpected response"] },
    Pattern { reason: "unexpected_content_type", needles: &["unexpected content type", "wrong content type"] },
    Pattern { reason: "corrupted_data", needles: &["corrupted data", "corrupt data", "checksum mismatch"] },
    Pattern { reason: "missing_expected_data", needles: &["missing expected data", "empty response"] },
];

const SYSTEM_PATTERNS: &[Pattern] = &[
    Pattern { reason: "config_error", needles: &["config error", "configuration error", "misconfigured"] },
    Pattern { reason: "dependency_error", needles: &["dependency error", "dependency failed"] },
    Pattern { reason: "gpu_error", needles: &["gpu error", "cuda error"] },
    Pattern { reason: "internal_error", needles: &["internal error", "internal server error"] },
];

const GROUPS: &[(FailureType, &[Pattern])] = &[
    (FailureType::GenerationRefusal, REFUSAL_PATTERNS),
    (FailureType::AuthError, AUTH_PATTERNS),
    (FailureType::RateLimit, RATE_LIMIT_PATTERNS),
    (FailureType::NetworkError, NETWORK_PATTERNS),
    (FailureType::ResourceLimit, RESOURCE_PATTERNS),
    (FailureType::ServiceError, SERVICE_PATTERNS),
    (FailureType::Timeout, TIMEOUT_PATTERNS),
    (FailureType::ValidationError, VALIDATION_PATTERNS),
    (FailureType::ResponseError, RESPONSE_PATTERNS),
    (FailureType::SystemError, SYSTEM_PATTERNS),
];

/// Provider request id pattern, e.g. OpenAI-style `wfr_0199...` (§4.4, §8 scenario 3).
fn extract_request_id(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let needle = b"wfr_";
    for start in 0..bytes.len().saturating_sub(needle.len()) {
        if &bytes[start..start + needle.len()] == needle {
            let mut end = start + needle.len();
            while end < bytes.len() && bytes[end].is_ascii_alphanumeric() {
                end += 1;
            }
            if end > start + needle.len() {
                return Some(text[start..end].to_string());
            }
        }
    }
    None
}

fn match_pattern_groups(lower: &str) -> Option<(FailureType, &'static str)> {
    for (ty, patterns) in GROUPS {
        for p in *patterns {
            if p.needles.iter().any(|n| lower.contains(n)) {
                return Some((*ty, p.reason));
            }
        }
    }
    None
}

/// Refine an HTTP-status-decisive type using message patterns within that
/// type's own reason set; falls back to a sensible default reason.
fn refine_reason(ty: FailureType, lower: &str) -> &'static str {
    let patterns = GROUPS.iter().find(|(t, _)| *t == ty).map(|(_, p)| *p).unwrap_or(&[]);
    for p in patterns {
        if p.needles.iter().any(|n| lower.contains(n)) {
            return p.reason;
        }
    }
    match ty {
        FailureType::AuthError => "invalid_api_key",
        FailureType::RateLimit => "requests_per_minute",
        FailureType::ServiceError => "service_unavailable",
        _ => "unknown_error",
    }
}

/// Classify a failure. Pure: depends only on `(message, context)`.
pub fn classify(message: &str, ctx: &ClassifyContext<'_>) -> Classification {
    let lower = message.to_lowercase();

    // HTTP status is consulted first when decisive (§4.5).
    if let Some(status) = ctx.http_status {
        let decisive = match status {
            401 | 403 => Some(FailureType::AuthError),
            429 => Some(FailureType::RateLimit),
            s if s >= 500 => Some(FailureType::ServiceError),
            _ => None,
        };
        if let Some(ty) = decisive {
            let reason = refine_reason(ty, &lower);
            return Classification {
                failure_type: ty,
                reason,
                description: describe(message, ctx),
            };
        }
    }

    if ctx.timeout {
        let reason = match_pattern_groups(&lower)
            .filter(|(t, _)| *t == FailureType::Timeout)
            .map(|(_, r)| r)
            .unwrap_or("network_timeout");
        return Classification {
            failure_type: FailureType::Timeout,
            reason,
            description: describe(message, ctx),
        };
    }

    if let Some((ty, reason)) = match_pattern_groups(&lower) {
        return Classification {
            failure_type: ty,
            reason,
            description: describe(message, ctx),
        };
    }

    tracing::warn!(
        service_type = ctx.service_type,
        message,
        "classifier fell through to system_error/unknown_error; add a pattern"
    );
    Classification {
        failure_type: FailureType::SystemError,
        reason: "unknown_error",
        description: describe(message, ctx),
    }
}

fn describe(message: &str, ctx: &ClassifyContext<'_>) -> String {
    let trimmed = message.trim();
    match extract_request_id(trimmed).or_else(|| ctx.raw_response.and_then(extract_request_id)) {
        Some(id) => format!("{trimmed} (request_id: {id})"),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ClassifyContext<'static> {
        ClassifyContext { service_type: "test", http_status: None, timeout: false, raw_response: None }
    }

    #[test]
    fn pure_same_input_same_output() {
        let a = classify("Connection refused", &ctx());
        let b = classify("Connection refused", &ctx());
        assert_eq!(a.failure_type, b.failure_type);
        assert_eq!(a.reason, b.reason);
        assert_eq!(a.description, b.description);
    }

    #[test]
    fn http_status_401_is_auth_error() {
        let mut c = ctx();
        c.http_status = Some(401);
        let r = classify("unauthorized", &c);
        assert_eq!(r.failure_type, FailureType::AuthError);
    }

    #[test]
    fn http_429_with_retry_after_is_rate_limit() {
        let mut c = ctx();
        c.http_status = Some(429);
        let r = classify("requests per minute exceeded", &c);
        assert_eq!(r.failure_type, FailureType::RateLimit);
        assert_eq!(r.reason, "requests_per_minute");
    }

    #[test]
    fn moderation_refusal_extracts_request_id() {
        let r = classify(
            "moderation_blocked: Your request was rejected by the safety system … wfr_0199961219e2757f90717eccfffb8a71",
            &ctx(),
        );
        assert_eq!(r.failure_type, FailureType::GenerationRefusal);
        assert_eq!(r.reason, "safety_filter");
        assert!(r.description.contains("wfr_0199961219e2757f90717eccfffb8a71"));
    }

    #[test]
    fn unmatched_message_falls_to_system_unknown() {
        let r = classify("some totally novel error nobody has seen", &ctx());
        assert_eq!(r.failure_type, FailureType::SystemError);
        assert_eq!(r.reason, "unknown_error");
    }

    /// §8: every (type, reason) pair enumerated in the taxonomy table has at
    /// least one representative message.
    #[test]
    fn every_reason_has_a_representative_message() {
        let cases: &[(&str, FailureType, &str)] = &[
            ("cannot generate this image due to policy violation", FailureType::GenerationRefusal, "policy_violation"),
            ("violence detected in prompt", FailureType::GenerationRefusal, "violence_detected"),
            ("blocked for copyright reasons", FailureType::GenerationRefusal, "copyright_blocker"),
            ("nsfw content detected", FailureType::GenerationRefusal, "nsfw_content"),
            ("hate speech detected", FailureType::GenerationRefusal, "hate_speech"),
            ("pii detected in output", FailureType::GenerationRefusal, "personal_info"),
            ("invalid api key supplied", FailureType::AuthError, "invalid_api_key"),
            ("token expired, please refresh", FailureType::AuthError, "expired_token"),
            ("insufficient permissions for this resource", FailureType::AuthError, "insufficient_permissions"),
            ("account suspended due to abuse", FailureType::AuthError, "account_suspended"),
            ("requests per minute limit hit", FailureType::RateLimit, "requests_per_minute"),
            ("tokens per minute exceeded", FailureType::RateLimit, "tokens_per_minute"),
            ("daily quota exceeded for this key", FailureType::RateLimit, "daily_quota_exceeded"),
            ("too many concurrent requests", FailureType::RateLimit, "concurrent_requests"),
            ("connection refused by remote host", FailureType::NetworkError, "connection_failed"),
            ("dns resolution failed for host", FailureType::NetworkError, "dns_resolution"),
            ("ssl certificate verify failed", FailureType::NetworkError, "ssl_certificate"),
            ("proxy error while forwarding", FailureType::NetworkError, "proxy_error"),
            ("service down for maintenance", FailureType::ServiceError, "service_down"),
            ("service unavailable right now", FailureType::ServiceError, "service_unavailable"),
            ("under maintenance mode currently", FailureType::ServiceError, "maintenance_mode"),
            ("degraded performance detected", FailureType::ServiceError, "degraded_performance"),
            ("job timeout exceeded", FailureType::Timeout, "job_timeout"),
            ("processing timeout hit", FailureType::Timeout, "processing_timeout"),
            ("queue timeout waiting for worker", FailureType::Timeout, "queue_timeout"),
            ("request timed out", FailureType::Timeout, "network_timeout"),
            ("missing required field 'prompt'", FailureType::ValidationError, "missing_required_field"),
            ("invalid format for payload", FailureType::ValidationError, "invalid_format"),
            ("unsupported operation requested", FailureType::ValidationError, "unsupported_operation"),
            ("model not found: gpt-9", FailureType::ValidationError, "model_not_found"),
            ("component error: node not found", FailureType::ValidationError, "component_error"),
            ("invalid payload structure", FailureType::ValidationError, "invalid_payload"),
            ("out of memory while loading model", FailureType::ResourceLimit, "out_of_memory"),
            ("no space left on device", FailureType::ResourceLimit, "disk_space_full"),
            ("gpu memory exhausted", FailureType::ResourceLimit, "gpu_memory_full"),
            ("concurrent limit reached for account", FailureType::ResourceLimit, "concurrent_limit"),
            ("invalid response format from backend", FailureType::ResponseError, "invalid_response_format"),
            ("unexpected content type returned", FailureType::ResponseError, "unexpected_content_type"),
            ("corrupted data in response body", FailureType::ResponseError, "corrupted_data"),
            ("missing expected data field", FailureType::ResponseError, "missing_expected_data"),
            ("configuration error in service", FailureType::SystemError, "config_error"),
            ("dependency error loading plugin", FailureType::SystemError, "dependency_error"),
            ("cuda error during inference", FailureType::SystemError, "gpu_error"),
            ("internal error occurred", FailureType::SystemError, "internal_error"),
        ];

        for (msg, expected_ty, expected_reason) in cases {
            let r = classify(msg, &ctx());
            assert_eq!(r.failure_type, *expected_ty, "message: {msg}");
            assert_eq!(r.reason, *expected_reason, "message: {msg}");
        }
    }

    #[test]
    fn retryable_flag_matches_taxonomy() {
        assert!(FailureType::NetworkError.is_retryable());
        assert!(FailureType::RateLimit.is_retryable());
        assert!(FailureType::Timeout.is_retryable());
        assert!(FailureType::ServiceError.is_retryable());
        assert!(!FailureType::AuthError.is_retryable());
        assert!(!FailureType::ValidationError.is_retryable());
        assert!(!FailureType::GenerationRefusal.is_retryable());
        assert!(!FailureType::ResourceLimit.is_retryable());
        assert!(!FailureType::ResponseError.is_retryable());
    }
}
