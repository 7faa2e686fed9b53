//! Single-job worker runtime (§4.3): one cooperative polling loop per
//! process, plus parallel internal tasks for heartbeating, job-health
//! monitoring, and command-stream listening, all communicating through the
//! single `ActiveJob` slot behind a mutex rather than shared mutable state
//! (§9 "arena + index" — there is one slot, not a map, because
//! `concurrent_jobs == 1` is a hard invariant).

use crate::broker::WorkerBroker;
use crate::connector::manager::ConnectorManager;
use crate::connector::websocket::ActivityNotice;
use crate::connector::{Connector, ConnectorError, HealthCheckOutcome, JobOutcome, ProgressUpdate};
use crate::config::Config;
use jobmesh_common::model::{Job, WorkerCapabilities, WorkerRecord, WorkerStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

/// The one job a worker may have in flight at a time (§4.3 / §5).
struct ActiveJob {
    job: Job,
    connector_id: String,
    last_websocket_activity_ts: i64,
    deadline_ms: i64,
    /// Taken by `check_active_job_health` when the connector's
    /// `HealthCheckJob` returns a terminal verdict, so `run_job`'s
    /// `process_job` race can be pre-empted instead of waiting out the
    /// full job timeout for a connector that will never call back (§4.3
    /// job health monitor).
    health_override: Option<oneshot::Sender<HealthOverrideOutcome>>,
}

/// What the job health monitor decided on a stalled job, relayed into
/// `run_job`'s select (§4.3: `complete_job`/`fail_job`/`return_to_queue`).
enum HealthOverrideOutcome {
    Complete(JobOutcome),
    Fail(ConnectorError),
    Requeue,
}

enum JobVerdict {
    Connector(Result<JobOutcome, ConnectorError>),
    HealthOverride(HealthOverrideOutcome),
}

/// A dropped sender (i.e. the job settled through `process_job` or the
/// timeout branch first) means no override is coming; never let that
/// resolve the `select!` on its own.
async fn await_health_override(rx: oneshot::Receiver<HealthOverrideOutcome>) -> HealthOverrideOutcome {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => std::future::pending().await,
    }
}

pub struct Runtime {
    broker: Arc<WorkerBroker>,
    manager: Arc<Mutex<ConnectorManager>>,
    capabilities: WorkerCapabilities,
    config: Config,
    active: Arc<Mutex<Option<ActiveJob>>>,
    worker_version: String,
    jobs_processed: AtomicU64,
}

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

impl Runtime {
    pub fn new(
        broker: Arc<WorkerBroker>,
        manager: Arc<Mutex<ConnectorManager>>,
        capabilities: WorkerCapabilities,
        config: Config,
    ) -> Self {
        Runtime {
            broker,
            manager,
            capabilities,
            config,
            active: Arc::new(Mutex::new(None)),
            worker_version: WORKER_VERSION.to_string(),
            jobs_processed: AtomicU64::new(0),
        }
    }

    /// Runs until `shutdown` resolves, then drains the in-flight job before
    /// returning (§11 graceful shutdown, generalized from the teacher's
    /// in-flight counter drain loop to "wait for the single active job").
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>, activity_rx: mpsc::Receiver<ActivityNotice>) {
        self.register().await;

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        let health_monitor = tokio::spawn(self.clone().health_monitor_loop(activity_rx));
        let command_listener = tokio::spawn(self.clone().command_listener());
        let sweeper = tokio::spawn(self.clone().timeout_sweeper_loop());

        let mut poll_interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, draining in-flight job");
                    break;
                }
                _ = poll_interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "poll iteration failed");
                    }
                }
            }
        }

        self.drain_active_job().await;
        heartbeat.abort();
        health_monitor.abort();
        command_listener.abort();
        sweeper.abort();
        self.manager.lock().await.cleanup_all().await;
        info!("jobmesh-worker stopped");
    }

    async fn register(&self) {
        let record = WorkerRecord {
            worker_id: self.config.worker_id.clone(),
            machine_id: self.config.machine_id.clone(),
            status: WorkerStatus::Initializing,
            capabilities: self.capabilities.clone(),
            current_job: None,
            last_heartbeat_ms: now_ms(),
            jobs_processed: 0,
        };
        if let Err(e) = self.broker.register(&record).await {
            error!(error = %e, "failed to register worker");
        }
    }

    /// §4.3 polling loop steps 1-8, run once per tick.
    async fn poll_once(&self) -> Result<(), crate::broker::WorkerBrokerError> {
        if self.active.lock().await.is_some() {
            return Ok(());
        }

        let job = match self.broker.request_job(&self.capabilities).await? {
            Some(job) => job,
            None => return Ok(()),
        };

        let manager = self.manager.lock().await;
        let connector = match manager.resolve(&job.service_required) {
            Some(c) => c,
            None => {
                warn!(job_id = %job.id, service = %job.service_required, "no connector registered for service type");
                return Ok(());
            }
        };
        drop(manager);

        self.broker.heartbeat(now_ms(), "busy", self.jobs_processed.load(Ordering::Relaxed)).await.ok();
        self.broker.announce_started(&job.id).await.ok();

        let (health_tx, health_rx) = oneshot::channel();
        {
            let mut active = self.active.lock().await;
            *active = Some(ActiveJob {
                job: job.clone(),
                connector_id: connector.connector_id().to_string(),
                last_websocket_activity_ts: now_ms(),
                deadline_ms: now_ms() + self.config.job_timeout.as_millis() as i64,
                health_override: Some(health_tx),
            });
        }

        self.run_job(job, connector, health_rx).await;

        {
            let mut active = self.active.lock().await;
            *active = None;
        }
        self.broker.heartbeat(now_ms(), "idle", self.jobs_processed.load(Ordering::Relaxed)).await.ok();
        Ok(())
    }

    async fn run_job(&self, job: Job, connector: Arc<dyn Connector>, health_rx: oneshot::Receiver<HealthOverrideOutcome>) {
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(32);
        let broker = self.broker.clone();
        let job_id = job.id.clone();
        let worker_id_for_relay = self.config.worker_id.clone();
        let relay = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                if let Err(e) = broker.update_progress(&job_id, update.progress, update.message.as_deref(), None).await {
                    warn!(job_id = %job_id, worker_id = %worker_id_for_relay, error = %e, "failed to relay progress");
                }
            }
        });

        // Per-job deadline (§4.3): the authoritative timeout enforcement.
        // `timeout_sweeper_loop` only re-checks the active slot as a
        // diagnostic backstop for a deadline that this select somehow
        // missed (e.g. this task wedged) — it never itself writes a
        // terminal attestation, so a job is never failed twice. The third
        // arm lets the job health monitor pre-empt a connector that will
        // never return from `process_job` on its own (§4.3 job health
        // monitor: `complete_job`/`fail_job`/`return_to_queue`).
        let outcome = tokio::select! {
            r = connector.process_job(&job, progress_tx) => JobVerdict::Connector(r),
            _ = tokio::time::sleep(self.config.job_timeout) => {
                warn!(job_id = %job.id, "job exceeded timeout deadline, cancelling");
                connector.cancel_job(&job.id).await;
                JobVerdict::Connector(Err(jobmesh_worker_timeout_error()))
            }
            over = await_health_override(health_rx) => {
                info!(job_id = %job.id, "health monitor pre-empted in-flight job");
                connector.cancel_job(&job.id).await;
                JobVerdict::HealthOverride(over)
            }
        };
        let _ = relay.await;

        match outcome {
            JobVerdict::Connector(Ok(result)) => self.settle_completion(&job, result).await,
            JobVerdict::Connector(Err(err)) => self.settle_failure(&job, err).await,
            JobVerdict::HealthOverride(HealthOverrideOutcome::Complete(result)) => {
                self.settle_completion(&job, result).await
            }
            JobVerdict::HealthOverride(HealthOverrideOutcome::Fail(err)) => self.settle_failure(&job, err).await,
            JobVerdict::HealthOverride(HealthOverrideOutcome::Requeue) => {
                // `ServiceError` (not `SystemError`) so `broker.fail`'s retry
                // gate treats this as retryable within the job's normal
                // retry budget, matching `return_to_queue`'s "give it back
                // to the queue" semantics rather than a terminal failure.
                let classification = jobmesh_common::classifier::Classification {
                    failure_type: jobmesh_common::classifier::FailureType::ServiceError,
                    reason: "health_check_requeue",
                    description: "health monitor requested the job be returned to the queue".to_string(),
                };
                match self
                    .broker
                    .fail(&job, &classification, &self.worker_version, &self.config.machine_id, None, None)
                    .await
                {
                    Ok(will_retry) => {
                        let terminal = if will_retry { None } else { Some("failed") };
                        self.broker.update_progress(&job.id, 0, Some(classification.description.as_str()), terminal).await.ok();
                    }
                    Err(e) => error!(job_id = %job.id, error = %e, "failed to record health-check requeue"),
                }
            }
        }
    }

    async fn settle_completion(&self, job: &Job, outcome: JobOutcome) {
        if let Err(e) = self
            .broker
            .complete(job, &self.worker_version, &self.config.machine_id, outcome.raw_request.as_ref(), outcome.raw_response.as_ref())
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to record completion");
        }
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.broker.update_progress(&job.id, 100, Some("completed"), Some("completed")).await.ok();
    }

    async fn settle_failure(&self, job: &Job, err: ConnectorError) {
        let classification = err.classify(&job.service_required);
        let raw_response = err.raw_response.as_ref().map(|r| serde_json::json!(r));
        match self
            .broker
            .fail(job, &classification, &self.worker_version, &self.config.machine_id, None, raw_response.as_ref())
            .await
        {
            Ok(will_retry) => {
                let terminal = if will_retry { None } else { Some("failed") };
                self.broker.update_progress(&job.id, 0, Some(err.message.as_str()), terminal).await.ok();
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record failure"),
        }
    }

    async fn drain_active_job(&self) {
        loop {
            if self.active.lock().await.is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            interval.tick().await;
            let status = if self.active.lock().await.is_some() { "busy" } else { "idle" };
            if let Err(e) = self.broker.heartbeat(now_ms(), status, self.jobs_processed.load(Ordering::Relaxed)).await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    /// §4.3 job health monitor: inspects `last_websocket_activity_ts` on the
    /// active job and, on inactivity, asks the connector's optional
    /// `HealthCheckJob` what to do.
    async fn health_monitor_loop(self: Arc<Self>, mut activity_rx: mpsc::Receiver<ActivityNotice>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                notice = activity_rx.recv() => {
                    let Some(notice) = notice else { continue };
                    let mut active = self.active.lock().await;
                    if let Some(job) = active.as_mut() {
                        if job.job.id == notice.job_id {
                            job.last_websocket_activity_ts = notice.ts_ms;
                        }
                    }
                }
                _ = interval.tick() => {
                    self.check_active_job_health().await;
                }
            }
        }
    }

    async fn check_active_job_health(&self) {
        let (job_id, connector_id, inactive_ms) = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(a) => (a.job.id.clone(), a.connector_id.clone(), now_ms() - a.last_websocket_activity_ts),
                None => return,
            }
        };

        if inactive_ms < self.config.inactivity_timeout.as_millis() as i64 {
            return;
        }

        let manager = self.manager.lock().await;
        let connector = manager.resolve_by_connector_id(&connector_id);
        drop(manager);
        let Some(connector) = connector else { return };

        let verdict = connector.health_check_job(&job_id).await;
        if matches!(verdict, HealthCheckOutcome::ContinueMonitoring) {
            return;
        }

        // Re-check under lock: the active job may have settled through its
        // normal `process_job` return between the health check call above
        // and now. `take()` also guarantees at most one override is ever
        // sent for a given job.
        let tx = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(a) if a.job.id == job_id => a.health_override.take(),
                _ => None,
            }
        };
        let Some(tx) = tx else { return };

        warn!(job_id, "health check requested a terminal action, pre-empting in-flight job");
        let override_outcome = match verdict {
            HealthCheckOutcome::CompleteJob(outcome) => HealthOverrideOutcome::Complete(outcome),
            HealthCheckOutcome::FailJob(err) => HealthOverrideOutcome::Fail(err),
            HealthCheckOutcome::ReturnToQueue => HealthOverrideOutcome::Requeue,
            HealthCheckOutcome::ContinueMonitoring => unreachable!("handled above"),
        };
        let _ = tx.send(override_outcome);
    }

    /// Separate 30s sweeper catching missed per-job timers (§4.3). This is a
    /// diagnostic backstop only: it never writes a terminal attestation
    /// itself, since `run_job`'s own timeout arm already owns that (and
    /// `REQUEUE_JOB`'s `retry_count` bump is not idempotent against a double
    /// settlement, §8). Instead it pre-empts `run_job`'s `select!` through
    /// the same `health_override` channel the job-health monitor uses, so a
    /// job only ever settles once no matter which arm notices the deadline
    /// first.
    async fn timeout_sweeper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let tx = {
                let mut active = self.active.lock().await;
                match active.as_mut() {
                    Some(a) if now_ms() >= a.deadline_ms => a.health_override.take().map(|tx| (tx, a.job.id.clone())),
                    _ => None,
                }
            };
            if let Some((tx, job_id)) = tx {
                warn!(job_id = %job_id, "timeout sweeper caught a missed per-job deadline, pre-empting");
                let _ = tx.send(HealthOverrideOutcome::Fail(jobmesh_worker_timeout_error()));
            }
        }
    }

    async fn command_listener(self: Arc<Self>) {
        let mut last_id = "$".to_string();
        loop {
            match self.broker.next_command(&last_id).await {
                Ok(commands) => {
                    for (id, fields) in commands {
                        last_id = id;
                        self.handle_command(fields).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "command stream read failed, backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn handle_command(&self, fields: std::collections::HashMap<String, String>) {
        let Some(action) = fields.get("action") else { return };
        match action.as_str() {
            "cancel" => {
                let Some(job_id) = fields.get("job_id") else { return };
                let active = self.active.lock().await;
                if let Some(active_job) = active.as_ref() {
                    if &active_job.job.id == job_id {
                        let connector_id = active_job.connector_id.clone();
                        drop(active);
                        let manager = self.manager.lock().await;
                        if let Some(connector) = manager.resolve_by_connector_id(&connector_id) {
                            connector.cancel_job(job_id).await;
                        }
                    }
                }
            }
            other => warn!(command = other, "unrecognized worker command"),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn jobmesh_worker_timeout_error() -> ConnectorError {
    ConnectorError::new("job exceeded configured timeout").with_timeout()
}
