//! Attestation construction and base64 scrubbing (§4.5).

use crate::classifier::Classification;
use crate::keys;
use crate::model::{Attestation, AttestationKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const SCRUBBED: &str = "[SCRUBBED_BASE64_DATA]";
const CIRCULAR: &str = "[CIRCULAR]";

static BASE64_BLOB: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=]{200,}$").unwrap());

fn looks_like_data_uri(s: &str) -> bool {
    s.starts_with("data:") && s.contains(";base64,")
}

/// Recursively replace base64-looking values with a sentinel (§4.5).
///
/// Idempotent: scrubbing an already-scrubbed value is a no-op, since the
/// sentinel string itself never matches the base64-blob or data-uri rules.
/// Circular references are broken by a depth cap rather than pointer
/// tracking, since `serde_json::Value` trees here are always acyclic (no
/// `Rc`/`Arc` cycles possible through JSON) — the cap exists purely to cap
/// pathological depth, not real cycles.
pub fn scrub(value: &Value) -> Value {
    scrub_inner(value, None, 0)
}

const MAX_DEPTH: usize = 64;

fn scrub_inner(value: &Value, key_hint: Option<&str>, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String(CIRCULAR.to_string());
    }

    let key_is_base64_named = key_hint
        .map(|k| k.to_lowercase().contains("base64"))
        .unwrap_or(false);

    match value {
        Value::String(s) => {
            if key_is_base64_named || BASE64_BLOB.is_match(s) || looks_like_data_uri(s) {
                Value::String(SCRUBBED.to_string())
            } else {
                Value::String(s.clone())
            }
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| scrub_inner(v, key_hint, depth + 1)).collect())
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), scrub_inner(v, Some(k), depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub struct AttestationInput<'a> {
    pub job_id: &'a str,
    pub worker_id: &'a str,
    pub machine_id: &'a str,
    pub worker_version: &'a str,
    pub workflow_id: Option<&'a str>,
    pub step: Option<u32>,
    pub total_steps: Option<u32>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub now_ms: i64,
    pub raw_request: Option<&'a Value>,
    pub raw_response: Option<&'a Value>,
}

pub fn completion_attestation(input: &AttestationInput<'_>) -> Attestation {
    Attestation {
        kind: AttestationKind::Completion,
        job_id: input.job_id.to_string(),
        worker_id: input.worker_id.to_string(),
        machine_id: input.machine_id.to_string(),
        worker_version: input.worker_version.to_string(),
        workflow_id: input.workflow_id.map(str::to_string),
        step: input.step,
        total_steps: input.total_steps,
        retry_count: input.retry_count,
        will_retry: false,
        max_retries: input.max_retries,
        error_message: None,
        failure_type: None,
        failure_reason: None,
        failure_description: None,
        attestation_created_at_ms: input.now_ms,
        completed_at_ms: Some(input.now_ms),
        failed_at_ms: None,
        raw_request: input.raw_request.map(scrub),
        raw_response: input.raw_response.map(scrub),
    }
}

pub fn failure_attestation(
    input: &AttestationInput<'_>,
    classification: &Classification,
    will_retry: bool,
) -> Attestation {
    Attestation {
        kind: if will_retry { AttestationKind::FailureRetry } else { AttestationKind::FailurePermanent },
        job_id: input.job_id.to_string(),
        worker_id: input.worker_id.to_string(),
        machine_id: input.machine_id.to_string(),
        worker_version: input.worker_version.to_string(),
        workflow_id: input.workflow_id.map(str::to_string),
        step: input.step,
        total_steps: input.total_steps,
        retry_count: input.retry_count,
        will_retry,
        max_retries: input.max_retries,
        error_message: Some(classification.description.clone()),
        failure_type: Some(classification.failure_type.as_str().to_string()),
        failure_reason: Some(classification.reason.to_string()),
        failure_description: Some(classification.description.clone()),
        attestation_created_at_ms: input.now_ms,
        completed_at_ms: None,
        failed_at_ms: Some(input.now_ms),
        raw_request: input.raw_request.map(scrub),
        raw_response: input.raw_response.map(scrub),
    }
}

/// The Redis key + TTL (seconds) an attestation must be written under.
///
/// Completion keys MUST also be written for permanent failures (§4.5
/// backwards-compatibility requirement), so callers writing a permanent
/// failure attestation should additionally call this with
/// `AttestationKind::Completion` for the same job/workflow/attempt.
pub fn attestation_key_and_ttl(att: &Attestation, attempt: u32) -> (String, i64) {
    match att.kind {
        AttestationKind::Completion => (
            keys::completion_key(att.workflow_id.as_deref(), &att.job_id, attempt),
            keys::PERMANENT_ATTESTATION_TTL_SECS,
        ),
        AttestationKind::FailureRetry => (
            keys::failure_retry_key(att.workflow_id.as_deref(), &att.job_id, attempt),
            keys::RETRY_ATTESTATION_TTL_SECS,
        ),
        AttestationKind::FailurePermanent => (
            keys::failure_permanent_key(att.workflow_id.as_deref(), &att.job_id),
            keys::PERMANENT_ATTESTATION_TTL_SECS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrub_replaces_long_base64_like_strings() {
        let blob = "A".repeat(250);
        let v = json!({ "image": blob, "note": "short string stays" });
        let scrubbed = scrub(&v);
        assert_eq!(scrubbed["image"], json!(SCRUBBED));
        assert_eq!(scrubbed["note"], json!("short string stays"));
    }

    #[test]
    fn scrub_replaces_data_uri() {
        let v = json!({ "img": "data:image/png;base64,AAAA" });
        let scrubbed = scrub(&v);
        assert_eq!(scrubbed["img"], json!(SCRUBBED));
    }

    #[test]
    fn scrub_replaces_by_key_name_regardless_of_length() {
        let v = json!({ "thumbnail_base64": "shortvalue" });
        let scrubbed = scrub(&v);
        assert_eq!(scrubbed["thumbnail_base64"], json!(SCRUBBED));
    }

    #[test]
    fn scrub_preserves_urls() {
        let v = json!({ "url": "https://example.com/output.png" });
        let scrubbed = scrub(&v);
        assert_eq!(scrubbed["url"], v["url"]);
    }

    #[test]
    fn scrub_is_idempotent() {
        let blob = "B".repeat(300);
        let v = json!({ "nested": { "data": blob, "list": [blob.clone(), "ok"] } });
        let once = scrub(&v);
        let twice = scrub(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn scrub_walks_recursively_into_arrays_and_maps() {
        let blob = "C".repeat(250);
        let v = json!({ "items": [{ "payload": blob }] });
        let scrubbed = scrub(&v);
        assert_eq!(scrubbed["items"][0]["payload"], json!(SCRUBBED));
    }
}
