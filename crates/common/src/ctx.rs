//! Retry-attempt extraction (§4.3, §9).
//!
//! Multiple upstream conventions encode "which retry attempt is this" in
//! different places. Precedence, highest first:
//!
//! 1. `ctx.workflow_context.retry_attempt`
//! 2. `payload.ctx.retry_count`
//! 3. `payload.ctx.retryCount`
//! 4. `job.retry_count`
//! 5. `0`
//!
//! Malformed JSON at any parse step falls through to the next source
//! rather than aborting extraction.
//!
//! Open question (§9) resolved: when `workflow_context.retry_attempt == 0`
//! is present, that counts as "primary source present" and wins over a
//! nonzero `payload.ctx.retry_count` — presence of the field, not its
//! truthiness, selects the source. See DESIGN.md for the full rationale.

use serde_json::Value;

pub fn extract_retry_attempt(job_ctx: &Value, payload: &[u8], job_retry_count: u32) -> u32 {
    if let Some(v) = job_ctx
        .get("workflow_context")
        .and_then(|wc| wc.get("retry_attempt"))
        .and_then(Value::as_u64)
    {
        return v as u32;
    }

    if let Ok(payload_json) = serde_json::from_slice::<Value>(payload) {
        if let Some(ctx) = payload_json.get("ctx") {
            if let Some(v) = ctx.get("retry_count").and_then(Value::as_u64) {
                return v as u32;
            }
            if let Some(v) = ctx.get("retryCount").and_then(Value::as_u64) {
                return v as u32;
            }
        }
    }

    job_retry_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_workflow_context_retry_attempt() {
        let ctx = json!({ "workflow_context": { "retry_attempt": 3 } });
        let payload = json!({ "ctx": { "retry_count": 9 } });
        let out = extract_retry_attempt(&ctx, payload.to_string().as_bytes(), 7);
        assert_eq!(out, 3);
    }

    #[test]
    fn zero_retry_attempt_present_wins_over_payload_retry_count() {
        let ctx = json!({ "workflow_context": { "retry_attempt": 0 } });
        let payload = json!({ "ctx": { "retry_count": 5 } });
        let out = extract_retry_attempt(&ctx, payload.to_string().as_bytes(), 7);
        assert_eq!(out, 0, "presence of retry_attempt=0 should win, not fall through");
    }

    #[test]
    fn falls_back_to_payload_retry_count_then_camel_case() {
        let ctx = json!({});
        let payload = json!({ "ctx": { "retry_count": 2 } });
        assert_eq!(extract_retry_attempt(&ctx, payload.to_string().as_bytes(), 7), 2);

        let payload_camel = json!({ "ctx": { "retryCount": 4 } });
        assert_eq!(extract_retry_attempt(&ctx, payload_camel.to_string().as_bytes(), 7), 4);
    }

    #[test]
    fn falls_back_to_job_retry_count_then_zero() {
        let ctx = json!({});
        assert_eq!(extract_retry_attempt(&ctx, b"not json", 7), 7);
        assert_eq!(extract_retry_attempt(&ctx, b"not json", 0), 0);
    }

    #[test]
    fn malformed_payload_json_falls_through_without_panicking() {
        let ctx = json!({});
        let out = extract_retry_attempt(&ctx, b"{not valid json", 2);
        assert_eq!(out, 2);
    }
}
