//! Data Pipeline (§4.E): bounded queues + workers shipping per-subject
//! events to the time-series sink, with a per-subject sink handler
//! lifecycle. Generalizes the original's `queue.Queue` + worker-thread pool
//! (`_data_worker`, `_trial_worker`, `ElasticSearchDataHandler`) into bounded
//! `tokio::sync::mpsc` channels drained by `tokio::spawn`ed workers. The
//! sink client is the official `elasticsearch` crate, matching the
//! original's official `elasticsearch-py` client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Jerusalem;
use elasticsearch::http::transport::Transport;
use elasticsearch::{Elasticsearch, IndexParts};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink handler is not running")]
    NotRunning,
}

/// One event as enqueued by the `DATA`/`CONTINUOUS`/`STREAM` handler (§6).
#[derive(Debug, Clone)]
pub struct DataEventEnvelope {
    pub subject: String,
    pub raw: Value,
}

/// One `INC_TRIAL_COUNTER` event as enqueued by its handler.
#[derive(Debug, Clone)]
pub struct TrialEvent {
    pub subject: String,
}

/// Per-subject sink handler: owns its own bounded queue and worker pool.
/// States: created -> prepared -> stopping, matching
/// `ElasticSearchDataHandler`'s `prepare_run`/`save`/`stop_run` lifecycle.
struct SinkHandler {
    tx: mpsc::Sender<Option<Value>>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl SinkHandler {
    async fn prepare(client: Elasticsearch, index: String, num_workers: usize, capacity: usize, request_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

        if let Err(e) = client.ping().send().await {
            warn!(error = %e, "sink ping failed during prepare, continuing optimistically");
        }

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..num_workers {
            let client = client.clone();
            let index = index.clone();
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                sink_worker(worker, client, index, rx, request_timeout).await;
            });
        }

        Self { tx, running }
    }

    async fn save(&self, mut event: Value) -> Result<(), SinkError> {
        if !self.running.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SinkError::NotRunning);
        }
        localize_timestamp(&mut event);
        self.tx.send(Some(event)).await.map_err(|_| SinkError::NotRunning)
    }

    /// Non-blocking: marks stopped and enqueues one sentinel per worker slot
    /// so each drains its remaining queue then exits.
    fn stop(&self, num_workers: usize) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        for _ in 0..num_workers {
            let _ = self.tx.try_send(None);
        }
    }
}

fn localize_timestamp(event: &mut Value) {
    if !event.is_object() {
        return;
    }
    if let Some(Value::Number(ts)) = event.get("timestamp").cloned() {
        if let Some(secs) = ts.as_f64() {
            if let Some(dt) = DateTime::<Utc>::from_timestamp(secs.trunc() as i64, 0) {
                let localized = dt.with_timezone(&Jerusalem);
                event["timestamp"] = Value::String(localized.to_rfc3339());
            }
        }
    }
}

async fn sink_worker(
    worker_id: usize,
    client: Elasticsearch,
    index: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Option<Value>>>>,
    request_timeout: Duration,
) {
    loop {
        let item = { rx.lock().await.recv().await };
        match item {
            None => break,
            Some(None) => break,
            Some(Some(document)) => {
                let result = tokio::time::timeout(
                    request_timeout,
                    client
                        .index(IndexParts::Index(&index))
                        .body(document)
                        .send(),
                )
                .await;
                match result {
                    Ok(Ok(response)) if response.status_code().is_success() => {
                        debug!(worker_id, "indexed event");
                    }
                    Ok(Ok(response)) => {
                        warn!(worker_id, status = %response.status_code(), "sink write rejected");
                    }
                    Ok(Err(e)) => {
                        warn!(worker_id, error = %e, "sink write error");
                    }
                    Err(_) => {
                        warn!(worker_id, "sink write timed out");
                    }
                }
            }
        }
    }
}

/// Bounded FIFOs for `DATA`/`CONTINUOUS`/`STREAM` and `INC_TRIAL_COUNTER`,
/// drained by N data workers and one trial worker respectively. A full
/// queue drops the event immediately rather than blocking the transport
/// loop (§4.E backpressure policy, invariant 6).
pub struct DataPipeline {
    data_tx: mpsc::Sender<DataEventEnvelope>,
    trial_tx: mpsc::Sender<TrialEvent>,
    dropped: Arc<std::sync::atomic::AtomicU64>,
    handlers: Arc<RwLock<HashMap<String, SinkHandler>>>,
    workers_per_subject: usize,
}

impl DataPipeline {
    /// Spawns the data-queue worker only. The trial queue's consumer is
    /// spawned separately by the caller (`Supervisor::new`) once the
    /// `RunController` it forwards to exists — see §9 "cycles between
    /// components", resolved by dependency injection at wiring time rather
    /// than a closure captured before the controller is constructed.
    pub fn spawn(
        sink_transport_url: &str,
        index: String,
        capacity: usize,
        num_data_workers: usize,
        sink_request_timeout: Duration,
    ) -> (Self, mpsc::Receiver<TrialEvent>) {
        let (data_tx, mut data_rx) = mpsc::channel::<DataEventEnvelope>(capacity);
        let (trial_tx, trial_rx) = mpsc::channel::<TrialEvent>(capacity);
        let dropped = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let transport = Transport::single_node(sink_transport_url).expect("invalid sink URL");
        let client = Elasticsearch::new(transport);

        let handlers: Arc<RwLock<HashMap<String, SinkHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let num_workers_per_subject = num_data_workers.max(1);

        // `mpsc::Receiver` has exactly one consumer; a single task drains it
        // and fans out to per-subject sink handlers, each of which runs its
        // own `num_workers_per_subject`-wide worker pool. This mirrors the
        // original's single `data_queue.get()` loop feeding N worker threads,
        // except fan-out happens per-subject rather than per-raw-event.
        let client_for_worker = client.clone();
        let index_for_worker = index.clone();
        let handlers_for_worker = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(event) = data_rx.recv().await {
                let mut guard = handlers_for_worker.write().await;
                if !guard.contains_key(&event.subject) {
                    let handler = SinkHandler::prepare(
                        client_for_worker.clone(),
                        index_for_worker.clone(),
                        num_workers_per_subject,
                        capacity,
                        sink_request_timeout,
                    )
                    .await;
                    guard.insert(event.subject.clone(), handler);
                }
                let handler = guard.get(&event.subject).unwrap();
                if let Err(e) = handler.save(event.raw).await {
                    error!(subject = %event.subject, error = %e, "failed to enqueue event to sink handler");
                }
            }
        });

        let pipeline = Self {
            data_tx,
            trial_tx,
            dropped,
            handlers,
            workers_per_subject: num_workers_per_subject,
        };
        (pipeline, trial_rx)
    }

    /// Ends a subject's sink handler lifecycle when its run stops or
    /// completes, matching `ElasticSearchDataHandler.stop_run`.
    pub async fn stop_subject(&self, subject: &str) {
        let mut guard = self.handlers.write().await;
        if let Some(handler) = guard.remove(subject) {
            handler.stop(self.workers_per_subject);
        }
    }

    pub fn push_data(&self, event: DataEventEnvelope) {
        if self.data_tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("DATA queue full, dropping message");
        }
    }

    pub fn push_trial(&self, event: TrialEvent) {
        if self.trial_tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("TRIAL queue full, dropping event");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn localize_timestamp_converts_epoch_seconds_to_rfc3339() {
        let mut event = json!({"subject": "s1", "timestamp": 1_700_000_000.0});
        localize_timestamp(&mut event);
        let ts = event["timestamp"].as_str().expect("timestamp should be a string");
        assert!(ts.contains('T'), "expected RFC3339 timestamp, got {ts}");
    }

    #[test]
    fn localize_timestamp_leaves_non_numeric_timestamp_untouched() {
        let mut event = json!({"subject": "s1", "timestamp": "already-a-string"});
        localize_timestamp(&mut event);
        assert_eq!(event["timestamp"], json!("already-a-string"));
    }
}
