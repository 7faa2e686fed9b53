//! WebSocket connector base (§4.4): a persistent connection with
//! exponential-backoff reconnection, in-flight job correlation by id, and
//! propagation of every inbound message's timestamp to the worker's
//! `last_websocket_activity_ts` via a typed channel the worker owns the
//! receiving end of (§9: "asynchronous callbacks → typed channel").

use super::{ConnectorError, JobOutcome, ProgressSender, ProgressUpdate};
use crate::connector::base::BaseConnector;
use crate::connector::{Connector, HealthCheckOutcome};
use futures_util::{SinkExt, StreamExt};
use jobmesh_common::model::{ConnectorStatus, ConnectorStatusReport, Job, ProtocolKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    JobProgress,
    JobComplete,
    JobFailed,
    Unknown,
}

/// Service-specific hooks a WebSocket connector subclass implements (§4.4).
pub trait WebSocketOps: Send + Sync {
    fn build_job_message(&self, job: &Job) -> Result<Message, ConnectorError>;
    fn classify_message(&self, text: &str) -> MessageClass;
    fn extract_job_id(&self, text: &str) -> Option<String>;
    fn extract_progress(&self, text: &str) -> Option<(u8, Option<String>)>;
    fn parse_job_result(&self, text: &str, job: &Job) -> Result<JobOutcome, ConnectorError>;
    fn parse_job_failure(&self, text: &str, job: &Job) -> ConnectorError;
    fn can_process_job(&self, job: &Job) -> bool;
}

/// Notifies the worker's job-health monitor of inbound activity for a job
/// (§4.3 "tracks `last_websocket_activity_ts`").
#[derive(Debug, Clone)]
pub struct ActivityNotice {
    pub job_id: String,
    pub ts_ms: i64,
}

enum InFlightOutcome {
    Result(Result<JobOutcome, ConnectorError>),
}

struct InFlightJob {
    job: Job,
    progress: ProgressSender,
    done: oneshot::Sender<InFlightOutcome>,
}

pub struct WebSocketConnector {
    base: BaseConnector,
    url: String,
    ops: Box<dyn WebSocketOps>,
    activity_tx: mpsc::Sender<ActivityNotice>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    in_flight: Arc<Mutex<HashMap<String, InFlightJob>>>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl WebSocketConnector {
    pub fn new(
        connector_id: String,
        service_type: String,
        redis: redis::Client,
        url: String,
        ops: Box<dyn WebSocketOps>,
        activity_tx: mpsc::Sender<ActivityNotice>,
    ) -> Self {
        WebSocketConnector {
            base: BaseConnector::new(connector_id, service_type, ProtocolKind::WebSocket, redis),
            url,
            ops,
            activity_tx,
            outbound: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }

    /// Spawns the connection-maintenance task: connect, read loop,
    /// reconnect-with-backoff on drop. Runs for the connector's lifetime.
    pub fn spawn_connection_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = this.reconnect_initial;
            loop {
                match this.run_connection().await {
                    Ok(()) => backoff = this.reconnect_initial,
                    Err(e) => {
                        warn!(connector_id = %this.base.connector_id(), error = %e, "websocket connection dropped, reconnecting");
                        this.base.set_status(ConnectorStatus::Error, Some(e.to_string())).await;
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(this.reconnect_max);
            }
        });
    }

    async fn run_connection(&self) -> Result<(), ConnectorError> {
        self.base.set_status(ConnectorStatus::Connecting, None).await;
        let (stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ConnectorError::new(format!("websocket connect failed: {e}")))?;
        self.base.set_status(ConnectorStatus::Idle, None).await;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        *self.outbound.lock().await = Some(out_tx);

        let writer = async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        };

        let reader = async {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                };
                if let Message::Text(text) = msg {
                    self.handle_inbound(text.as_str()).await;
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        *self.outbound.lock().await = None;
        Err(ConnectorError::new("websocket stream ended"))
    }

    async fn handle_inbound(&self, text: &str) {
        let ts_ms = super::now_ms();
        if let Some(job_id) = self.ops.extract_job_id(text) {
            let _ = self.activity_tx.send(ActivityNotice { job_id: job_id.clone(), ts_ms }).await;

            match self.ops.classify_message(text) {
                MessageClass::JobProgress => {
                    if let Some((pct, message)) = self.ops.extract_progress(text) {
                        let guard = self.in_flight.lock().await;
                        if let Some(job) = guard.get(&job_id) {
                            let _ = job.progress.send(ProgressUpdate { progress: pct, message }).await;
                        }
                    }
                }
                MessageClass::JobComplete => {
                    let entry = self.in_flight.lock().await.remove(&job_id);
                    if let Some(entry) = entry {
                        let result = self.ops.parse_job_result(text, &entry.job);
                        let _ = entry.done.send(InFlightOutcome::Result(result));
                    }
                }
                MessageClass::JobFailed => {
                    let entry = self.in_flight.lock().await.remove(&job_id);
                    if let Some(entry) = entry {
                        let err = self.ops.parse_job_failure(text, &entry.job);
                        debug!(job_id = %job_id, error = %err, "websocket reported job failure");
                        let _ = entry.done.send(InFlightOutcome::Result(Err(err)));
                    }
                }
                MessageClass::Unknown => {}
            }
        }
    }

    async fn send(&self, msg: Message) -> Result<(), ConnectorError> {
        let guard = self.outbound.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(msg).await.map_err(|_| ConnectorError::new("websocket outbound channel closed")),
            None => Err(ConnectorError::new("websocket not connected")),
        }
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    fn connector_id(&self) -> &str {
        self.base.connector_id()
    }

    fn service_type(&self) -> &str {
        self.base.service_type()
    }

    fn protocol(&self) -> ProtocolKind {
        self.base.protocol()
    }

    async fn initialize(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn cleanup(&self) {
        self.base.set_status(ConnectorStatus::Offline, None).await;
    }

    async fn check_health(&self) -> bool {
        let connected = self.outbound.lock().await.is_some();
        self.base.record_check(connected).await;
        connected
    }

    async fn get_available_models(&self) -> Vec<String> {
        Vec::new()
    }

    fn can_process_job(&self, job: &Job) -> bool {
        self.ops.can_process_job(job)
    }

    async fn process_job(&self, job: &Job, progress: ProgressSender) -> Result<JobOutcome, ConnectorError> {
        self.base.set_status(ConnectorStatus::Active, None).await;
        let msg = self.ops.build_job_message(job)?;

        let (done_tx, done_rx) = oneshot::channel();
        self.in_flight
            .lock()
            .await
            .insert(job.id.clone(), InFlightJob { job: job.clone(), progress, done: done_tx });

        self.send(msg).await?;

        let outcome = match done_rx.await {
            Ok(InFlightOutcome::Result(r)) => r,
            Err(_) => Err(ConnectorError::new("websocket connection closed before job completed")),
        };

        self.in_flight.lock().await.remove(&job.id);
        self.base.set_status(ConnectorStatus::Idle, None).await;
        outcome
    }

    async fn cancel_job(&self, job_id: &str) {
        self.in_flight.lock().await.remove(job_id);
    }

    async fn health_check_job(&self, _job_id: &str) -> HealthCheckOutcome {
        HealthCheckOutcome::ContinueMonitoring
    }

    fn status_report(&self) -> ConnectorStatusReport {
        self.base.report()
    }
}
