//! Event / progress bridge (§4.6): fans one Redis stream reader per job out
//! to many SSE/WS subscribers.
//!
//! The registry below is the "arena + index" pattern from §9: subscribers
//! never hold a reference to the reader task directly, they hold a job id
//! and look the reader up through `Bridge`, which owns the map.

use jobmesh_common::keys;
use jobmesh_common::model::ProgressEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Progress(ProgressEvent),
    SlowConsumer,
}

struct JobReader {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<BridgeEvent>>>,
    next_sub_id: AtomicU64,
}

impl JobReader {
    fn new() -> Self {
        JobReader { subscribers: Mutex::new(HashMap::new()), next_sub_id: AtomicU64::new(1) }
    }

    async fn fan_out(&self, event: BridgeEvent) {
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in subs.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "SSE subscriber queue full, dropping as slow_consumer");
                    let _ = tx.try_send(BridgeEvent::SlowConsumer);
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            subs.remove(&id);
        }
    }

    async fn is_empty(&self) -> bool {
        self.subscribers.lock().await.is_empty()
    }
}

/// Unsubscribes from the bridge when dropped, independent of the receiver's
/// lifetime so the receiver itself can be moved into a stream combinator.
pub struct SubscriptionGuard {
    job_id: String,
    sub_id: u64,
    bridge: Arc<BridgeInner>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let bridge = self.bridge.clone();
        let job_id = self.job_id.clone();
        let sub_id = self.sub_id;
        tokio::spawn(async move {
            bridge.unsubscribe(&job_id, sub_id).await;
        });
    }
}

pub struct Subscription {
    pub job_id: String,
    pub receiver: mpsc::Receiver<BridgeEvent>,
    pub guard: SubscriptionGuard,
}

struct BridgeInner {
    redis_client: redis::Client,
    queue_capacity: usize,
    readers: Mutex<HashMap<String, Arc<JobReader>>>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(redis_client: redis::Client, queue_capacity: usize) -> Self {
        Bridge {
            inner: Arc::new(BridgeInner {
                redis_client,
                queue_capacity,
                readers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a new subscriber to `job_id`'s progress stream, starting the
    /// Redis reader task if this is the first subscriber (§4.6 "the first
    /// subscriber opens an XREAD BLOCK 0 reader; additional subscribers
    /// attach to the same reader").
    pub async fn subscribe(&self, job_id: &str) -> Subscription {
        let mut readers = self.inner.readers.lock().await;
        let is_new = !readers.contains_key(job_id);
        let reader = readers.entry(job_id.to_string()).or_insert_with(|| Arc::new(JobReader::new())).clone();
        drop(readers);

        if is_new {
            let redis_client = self.inner.redis_client.clone();
            let job_id_owned = job_id.to_string();
            let reader_for_task = reader.clone();
            let bridge_for_task = self.inner.clone();
            tokio::spawn(async move {
                run_reader(redis_client, job_id_owned.clone(), reader_for_task).await;
                bridge_for_task.readers.lock().await.remove(&job_id_owned);
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let sub_id = reader.next_sub_id.fetch_add(1, Ordering::SeqCst);
        reader.subscribers.lock().await.insert(sub_id, tx);

        Subscription {
            job_id: job_id.to_string(),
            receiver: rx,
            guard: SubscriptionGuard { job_id: job_id.to_string(), sub_id, bridge: self.inner.clone() },
        }
    }
}

impl BridgeInner {
    async fn unsubscribe(&self, job_id: &str, sub_id: u64) {
        let readers = self.readers.lock().await;
        if let Some(reader) = readers.get(job_id) {
            reader.subscribers.lock().await.remove(&sub_id);
        }
    }
}

/// Runs until the subscriber count for `job_id` reaches zero, a terminal
/// event is delivered, or the reader is orphaned. Reconnects to Redis with
/// exponential backoff, resuming from the last delivered entry id so
/// subscribers don't miss events across brief Redis outages (§4.6).
async fn run_reader(redis_client: redis::Client, job_id: String, reader: Arc<JobReader>) {
    use redis::streams::{StreamReadOptions, StreamReadReply};
    use redis::AsyncCommands;

    let stream_key = keys::progress_stream(&job_id);
    let mut last_id = "$".to_string();
    let mut backoff_ms = 200u64;

    loop {
        if reader.is_empty().await {
            debug!(job_id = %job_id, "no subscribers left, closing reader");
            return;
        }

        let mut con = match redis_client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "bridge reader failed to connect, backing off");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(10_000);
                continue;
            }
        };
        backoff_ms = 200;

        let opts = StreamReadOptions::default().block(5_000);
        let reply: redis::RedisResult<StreamReadReply> =
            con.xread_options(&[&stream_key], &[last_id.as_str()], &opts).await;

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "bridge reader XREAD failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
        };

        let mut saw_terminal = false;
        for stream in reply.keys {
            for entry in stream.ids {
                last_id = entry.id.clone();
                if let Some(event) = decode_progress_entry(&job_id, &entry.map) {
                    let is_terminal = event.terminal_status.is_some();
                    reader.fan_out(BridgeEvent::Progress(event)).await;
                    if is_terminal {
                        saw_terminal = true;
                    }
                }
            }
        }

        if saw_terminal {
            debug!(job_id = %job_id, "terminal event delivered, closing reader");
            return;
        }
    }
}

fn decode_progress_entry(job_id: &str, fields: &HashMap<String, redis::Value>) -> Option<ProgressEvent> {
    let get = |k: &str| -> Option<String> {
        match fields.get(k)? {
            redis::Value::BulkString(b) => Some(String::from_utf8_lossy(b).to_string()),
            redis::Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        }
    };
    Some(ProgressEvent {
        job_id: job_id.to_string(),
        progress: get("progress").and_then(|v| v.parse().ok()).unwrap_or(0),
        message: get("message").filter(|s| !s.is_empty()),
        worker_id: get("worker_id").unwrap_or_default(),
        ts_ms: get("ts").and_then(|v| v.parse().ok()).unwrap_or(0),
        terminal_status: get("status").filter(|s| !s.is_empty()),
        started: get("started").is_some_and(|v| v == "1"),
    })
}
