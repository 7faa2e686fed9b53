//! Webhook dispatcher (§4.7): fans terminal/progress events out to
//! subscriber URLs with HMAC-signed, retried deliveries.
//!
//! Grounded in the same shape `ipcasj-ethhook`'s delivery publisher uses
//! (per-endpoint `hmac_secret`, a bounded delivery queue) but collapsed into
//! one in-process dispatcher instead of a separate publish/consume queue,
//! since the hub already owns the event stream via `bridge`.

use hmac::{Hmac, Mac};
use jobmesh_common::model::{ProgressEvent, WebhookFilter, WebhookSubscription};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookPayload {
    pub event_type: String,
    pub event_id: String,
    pub timestamp_ms: i64,
    pub webhook_id: String,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub webhook_id: String,
    pub event_id: String,
    pub attempt: u32,
    pub status: Result<u16, String>,
    pub ts_ms: i64,
}

/// What the dispatcher is asked to fan out: a job event plus enough
/// context to run subscription filters against (§4.7 step 1).
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub event_type: String,
    pub job_id: String,
    pub job_type: Option<String>,
    pub priority: Option<i64>,
    pub machine_id: Option<String>,
    pub worker_id: Option<String>,
    pub custom: serde_json::Map<String, serde_json::Value>,
    pub progress: Option<ProgressEvent>,
    pub extra: serde_json::Value,
}

fn matches_filter(filter: &WebhookFilter, event: &DispatchEvent) -> bool {
    if let Some(jt) = &filter.job_type {
        if event.job_type.as_deref() != Some(jt.as_str()) {
            return false;
        }
    }
    if let Some(p) = filter.priority {
        if event.priority != Some(p) {
            return false;
        }
    }
    if let Some(prefix) = &filter.machine_id_prefix {
        match &event.machine_id {
            Some(m) if m.starts_with(prefix.as_str()) => {}
            _ => return false,
        }
    }
    if let Some(w) = &filter.worker_id {
        if event.worker_id.as_deref() != Some(w.as_str()) {
            return false;
        }
    }
    for (k, v) in &filter.custom {
        if event.custom.get(k) != Some(v) {
            return false;
        }
    }
    true
}

struct DispatcherInner {
    http: reqwest::Client,
    max_attempts: u32,
    retry_base: Duration,
    history: RwLock<VecDeque<DeliveryRecord>>,
    history_cap: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(max_attempts: u32, retry_base: Duration) -> Self {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                http: reqwest::Client::new(),
                max_attempts,
                retry_base,
                history: RwLock::new(VecDeque::new()),
                history_cap: 1000,
            }),
        }
    }

    /// Spawns the dispatch loop, returning a sender events are pushed onto.
    /// `subscriptions` is re-read on every event so callers can add/remove
    /// subscriptions without restarting the dispatcher.
    pub fn spawn(self, subscriptions: Arc<RwLock<Vec<WebhookSubscription>>>) -> mpsc::Sender<DispatchEvent> {
        let (tx, mut rx) = mpsc::channel::<DispatchEvent>(1024);
        let dispatcher = self;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs = subscriptions.read().await.clone();
                for sub in subs {
                    if !sub.events.iter().any(|e| e == &event.event_type) {
                        continue;
                    }
                    if !matches_filter(&sub.filter, &event) {
                        continue;
                    }
                    let dispatcher = dispatcher.clone();
                    let sub = sub.clone();
                    let event = event.clone();
                    tokio::spawn(async move {
                        dispatcher.deliver(&sub, &event).await;
                    });
                }
            }
        });
        tx
    }

    fn build_payload(sub: &WebhookSubscription, event: &DispatchEvent, now_ms: i64) -> WebhookPayload {
        let data = event.progress.as_ref().map(|p| serde_json::to_value(p).unwrap_or_default()).unwrap_or_else(|| event.extra.clone());
        WebhookPayload {
            event_type: event.event_type.clone(),
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: now_ms,
            webhook_id: sub.id.clone(),
            data,
            metadata: serde_json::json!({ "job_id": event.job_id }),
        }
    }

    async fn deliver(&self, sub: &WebhookSubscription, event: &DispatchEvent) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let payload = Self::build_payload(sub, event, now_ms);
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(webhook_id = %sub.id, error = %e, "failed to serialize webhook payload");
                return;
            }
        };

        let signature = sub.secret.as_deref().map(|secret| {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
            mac.update(&body);
            hex::encode(mac.finalize().into_bytes())
        });

        let mut attempt = 0u32;
        let mut backoff = self.inner.retry_base;

        loop {
            attempt += 1;
            let mut req = self
                .inner
                .http
                .post(&sub.url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Event", &event.event_type)
                .header("X-Webhook-ID", &sub.id)
                .header("X-Event-ID", &payload.event_id)
                .body(body.clone());
            if let Some(sig) = &signature {
                req = req.header("X-Webhook-Signature", format!("sha256={sig}"));
            }
            for (k, v) in &sub.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let outcome = req.send().await;
            let (record_status, retry_after, should_retry) = match &outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = status.as_u16() == 429
                        && resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok());
                    (Ok(status.as_u16()), retry_after, status.as_u16() >= 400)
                }
                Err(e) => (Err(e.to_string()), None, true),
            };

            self.record(DeliveryRecord {
                webhook_id: sub.id.clone(),
                event_id: payload.event_id.clone(),
                attempt,
                status: record_status.clone(),
                ts_ms: now_ms,
            })
            .await;

            if !should_retry || attempt >= self.inner.max_attempts.max(sub.max_attempts) {
                if should_retry {
                    warn!(webhook_id = %sub.id, attempt, "webhook delivery exhausted retries");
                } else {
                    debug!(webhook_id = %sub.id, attempt, "webhook delivered");
                }
                return;
            }

            let wait = retry_after.map(Duration::from_secs).unwrap_or(backoff);
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }

    async fn record(&self, rec: DeliveryRecord) {
        let mut history = self.inner.history.write().await;
        if history.len() >= self.inner.history_cap {
            history.pop_front();
        }
        history.push_back(rec);
    }

    pub async fn history(&self) -> Vec<DeliveryRecord> {
        self.inner.history.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> WebhookSubscription {
        WebhookSubscription {
            id: "wh1".into(),
            url: "https://example.com/hook".into(),
            events: vec!["job_completed".into()],
            filter: WebhookFilter::default(),
            secret: Some("s3cr3t".into()),
            max_attempts: 3,
            headers: Default::default(),
        }
    }

    fn base_event() -> DispatchEvent {
        DispatchEvent {
            event_type: "job_completed".into(),
            job_id: "j1".into(),
            job_type: Some("rest_echo".into()),
            priority: Some(50),
            machine_id: Some("machine-east-1".into()),
            worker_id: Some("w1".into()),
            custom: Default::default(),
            progress: None,
            extra: serde_json::json!({}),
        }
    }

    #[test]
    fn filter_matches_job_type_and_machine_prefix() {
        let mut filter = WebhookFilter::default();
        filter.job_type = Some("rest_echo".into());
        filter.machine_id_prefix = Some("machine-east".into());
        assert!(matches_filter(&filter, &base_event()));

        filter.job_type = Some("other".into());
        assert!(!matches_filter(&filter, &base_event()));
    }

    #[test]
    fn signature_is_deterministic_for_same_body() {
        let s = sub();
        let payload = Dispatcher::build_payload(&s, &base_event(), 1_000);
        let body = serde_json::to_vec(&payload).unwrap();
        let mut mac = HmacSha256::new_from_slice(s.secret.as_deref().unwrap().as_bytes()).unwrap();
        mac.update(&body);
        let sig1 = hex::encode(mac.finalize().into_bytes());

        let mut mac2 = HmacSha256::new_from_slice(s.secret.as_deref().unwrap().as_bytes()).unwrap();
        mac2.update(&body);
        let sig2 = hex::encode(mac2.finalize().into_bytes());
        assert_eq!(sig1, sig2);
    }
}
