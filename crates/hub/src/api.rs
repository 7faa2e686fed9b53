//! Submission HTTP API (§6): `POST /jobs`, `GET /jobs/{id}`,
//! `POST /jobs/{id}/cancel`, `GET /jobs/{id}/progress` (SSE).

use crate::bridge::{Bridge, BridgeEvent};
use crate::broker::Broker;
use crate::webhook::DispatchEvent;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{http::StatusCode, routing::get, routing::post, Json, Router};
use futures_util::stream::Stream;
use jobmesh_common::model::{Job, JobRequirements, JobStatus};
use jobmesh_common::extract_retry_attempt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    pub bridge: Bridge,
    pub webhook_tx: Option<mpsc::Sender<DispatchEvent>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/progress", get(progress_sse))
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    #[serde(rename = "type")]
    service_required: String,
    priority: i64,
    payload: serde_json::Value,
    #[serde(default)]
    requirements: JobRequirements,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    step: Option<u32>,
    #[serde(default)]
    total_steps: Option<u32>,
    #[serde(default)]
    ctx: serde_json::Value,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: String,
    position: Option<u64>,
    /// Always empty: the broker notifies workers by letting them poll
    /// `RequestJob`, not by pushing a notification list (§4.2). Kept for
    /// wire compatibility with §6's response shape.
    notified_workers: Vec<String>,
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let payload = serde_json::to_vec(&req.payload).unwrap_or_default();
    // §4.3/§9 retry-count-extraction precedence: a resubmitted job may carry
    // its prior attempt count in `ctx.workflow_context.retry_attempt` or
    // `payload.ctx.retry_count`/`retryCount`; that governs the job's starting
    // `retry_count` rather than always starting fresh at 0.
    let retry_count = extract_retry_attempt(&req.ctx, &payload, 0);
    let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        service_required: req.service_required,
        priority: req.priority,
        payload,
        ctx: req.ctx,
        requirements: req.requirements,
        customer_id: req.customer_id,
        workflow_id: req.workflow_id,
        step: req.step,
        total_steps: req.total_steps,
        status: JobStatus::Pending,
        retry_count,
        max_retries: 3,
        submitted_at_ms: now_ms,
        assigned_at_ms: None,
        completed_at_ms: None,
        assigned_worker: None,
        last_error: None,
    };

    let job_id = state.broker.submit(job, now_ms).await?;
    let position = state.broker.pending_position(&job_id).await?;
    info!(job_id = %job_id, "job submitted");
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse { job_id, position, notified_workers: Vec::new() }),
    ))
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<Job>, ApiError> {
    match state.broker.get_job(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound),
    }
}

async fn cancel_job(State(state): State<ApiState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let cancelled = state.broker.cancel(&id, now_ms).await?;
    if !cancelled {
        return Err(ApiError::NotFound);
    }
    if let Some(tx) = &state.webhook_tx {
        let _ = tx
            .send(DispatchEvent {
                event_type: "job_cancelled".into(),
                job_id: id.clone(),
                job_type: None,
                priority: None,
                machine_id: None,
                worker_id: None,
                custom: Default::default(),
                progress: None,
                extra: serde_json::json!({ "job_id": id }),
            })
            .await;
    }
    Ok(StatusCode::OK)
}

async fn progress_sse(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let sub = state.bridge.subscribe(&id).await;
    let stream = ReceiverStream::new(sub.receiver).map(|event| {
        let sse_event = match event {
            BridgeEvent::Progress(p) => {
                let name = match p.terminal_status.as_deref() {
                    Some("completed") => "job_completed",
                    Some("failed") => "job_failed",
                    Some("cancelled") => "job_cancelled",
                    _ if p.started => "job_started",
                    _ => "job_progress",
                };
                Event::default().event(name).json_data(&p).unwrap_or_else(|_| Event::default())
            }
            BridgeEvent::SlowConsumer => Event::default().event("slow_consumer").data("subscriber queue overflowed"),
        };
        Ok(sse_event)
    });
    // `guard`'s Drop unsubscribes from the bridge when the SSE connection closes.
    let guarded = GuardedStream { inner: stream, _guard: sub.guard };
    Sse::new(guarded).keep_alive(KeepAlive::default())
}

struct GuardedStream<S> {
    inner: S,
    _guard: crate::bridge::SubscriptionGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;
    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Broker(crate::broker::BrokerError),
}

impl From<crate::broker::BrokerError> for ApiError {
    fn from(e: crate::broker::BrokerError) -> Self {
        ApiError::Broker(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" }))).into_response(),
            ApiError::Broker(e) => {
                error!(error = %e, "broker error handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": "internal error" }))).into_response()
            }
        }
    }
}
