//! Legacy WebSocket interface (§6): `submit_job`, `cancel_job`,
//! `request_job_status`, `subscribe_progress`, `subscribe_stats`, `ping`.
//!
//! Forwards every message to the same `Broker`/`Bridge` operations the HTTP
//! API uses (§6 "MUST forward these to the same broker operations... and
//! MUST NOT bypass the claim script") — this module holds no broker logic
//! of its own, only message parsing and response framing.

use crate::api::ApiState;
use crate::bridge::BridgeEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use jobmesh_common::extract_retry_attempt;
use jobmesh_common::model::{Job, JobRequirements, JobStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub fn router(state: ApiState) -> Router {
    Router::new().route("/ws", get(handler)).with_state(state)
}

async fn handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubmitJob {
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
        ctx: serde_json::Value,
    },
    CancelJob {
        job_id: String,
    },
    RequestJobStatus {
        job_id: String,
    },
    SubscribeProgress {
        job_id: String,
    },
    SubscribeStats,
    Ping,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    JobSubmitted { job_id: &'a str, position: Option<u64> },
    JobCancelled { job_id: &'a str },
    JobStatus { job: Option<Job> },
    Error { message: String },
    Pong,
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    // Only one `subscribe_progress` job is tracked per connection, matching
    // the HTTP SSE bridge's one-reader-per-job shape: a new subscription
    // replaces the old one. Progress frames arrive on `progress_rx` and are
    // interleaved with inbound client frames via `select!` below, since a
    // single `WebSocket` can't be read and written from two tasks at once.
    let mut progress_task: Option<tokio::task::JoinHandle<()>> = None;
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<String>(256);

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(Ok(msg)) = frame else { break };
                let Message::Text(text) = msg else { continue };
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                let client_msg = match parsed {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = send_json(&mut socket, &ServerMessage::Error { message: e.to_string() }).await;
                        continue;
                    }
                };
                if !handle_client_message(client_msg, &mut socket, &state, &mut progress_task, progress_tx.clone()).await {
                    break;
                }
            }
            Some(text) = progress_rx.recv() => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(handle) = progress_task.take() {
        handle.abort();
    }
    warn!("websocket connection closed");
}

/// Returns `false` if the connection should close.
async fn handle_client_message(
    client_msg: ClientMessage,
    socket: &mut WebSocket,
    state: &ApiState,
    progress_task: &mut Option<tokio::task::JoinHandle<()>>,
    progress_tx: tokio::sync::mpsc::Sender<String>,
) -> bool {
    match client_msg {
        ClientMessage::Ping => {
            let _ = send_json(socket, &ServerMessage::Pong).await;
        }
        ClientMessage::SubmitJob { service_required, priority, payload, requirements, customer_id, workflow_id, ctx } => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let payload_bytes = serde_json::to_vec(&payload).unwrap_or_default();
            // Same §4.3/§9 precedence the HTTP submission path applies, so
            // the legacy WebSocket surface can't bypass it (§6 "MUST forward
            // these to the same broker operations").
            let retry_count = extract_retry_attempt(&ctx, &payload_bytes, 0);
            let job = Job {
                id: uuid::Uuid::new_v4().to_string(),
                service_required,
                priority,
                payload: payload_bytes,
                ctx,
                requirements,
                customer_id,
                workflow_id,
                step: None,
                total_steps: None,
                status: JobStatus::Pending,
                retry_count,
                max_retries: 3,
                submitted_at_ms: now_ms,
                assigned_at_ms: None,
                completed_at_ms: None,
                assigned_worker: None,
                last_error: None,
            };
            match state.broker.submit(job, now_ms).await {
                Ok(job_id) => {
                    let position = state.broker.pending_position(&job_id).await.ok().flatten();
                    let _ = send_json(socket, &ServerMessage::JobSubmitted { job_id: &job_id, position }).await;
                }
                Err(e) => {
                    let _ = send_json(socket, &ServerMessage::Error { message: e.to_string() }).await;
                }
            }
        }
        ClientMessage::CancelJob { job_id } => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            match state.broker.cancel(&job_id, now_ms).await {
                Ok(true) => {
                    let _ = send_json(socket, &ServerMessage::JobCancelled { job_id: &job_id }).await;
                }
                Ok(false) => {
                    let _ = send_json(socket, &ServerMessage::Error { message: format!("job {job_id} not found") }).await;
                }
                Err(e) => {
                    let _ = send_json(socket, &ServerMessage::Error { message: e.to_string() }).await;
                }
            }
        }
        ClientMessage::RequestJobStatus { job_id } => match state.broker.get_job(&job_id).await {
            Ok(job) => {
                let _ = send_json(socket, &ServerMessage::JobStatus { job }).await;
            }
            Err(e) => {
                let _ = send_json(socket, &ServerMessage::Error { message: e.to_string() }).await;
            }
        },
        ClientMessage::SubscribeProgress { job_id } => {
            if let Some(handle) = progress_task.take() {
                handle.abort();
            }
            let sub = state.bridge.subscribe(&job_id).await;
            let mut receiver = sub.receiver;
            let guard = sub.guard;
            let forward_tx = progress_tx;
            let fwd_task = tokio::spawn(async move {
                let _guard = guard;
                while let Some(event) = receiver.recv().await {
                    let text = match event {
                        BridgeEvent::Progress(p) => serde_json::to_string(&p).unwrap_or_default(),
                        BridgeEvent::SlowConsumer => "{\"type\":\"slow_consumer\"}".to_string(),
                    };
                    if forward_tx.send(text).await.is_err() {
                        break;
                    }
                }
            });
            *progress_task = Some(fwd_task);
        }
        ClientMessage::SubscribeStats => {
            debug!("subscribe_stats received (no-op: stats aggregation is out of scope)");
        }
    }
    true
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, msg: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
