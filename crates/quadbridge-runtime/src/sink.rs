//! Sink seam and its implementations.
//!
//! A [`TelemetrySink`] is owned by exactly one device stream task.  Its
//! lifecycle is `start` → any number of `publish` → `stop` → `disconnect`,
//! and `publish` must not wait for the remote side to acknowledge.
//!
//! - [`ThingsboardSink`] – ThingsBoard device HTTP API, delivered by a
//!   background worker so publishing is an enqueue.
//! - [`MemorySink`] – records everything in process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quadbridge_types::{BridgeError, Qos, SecretToken, WireRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Attempts made for a [`Qos::AtLeastOnce`] delivery.
const AT_LEAST_ONCE_ATTEMPTS: u32 = 3;

/// Pause between delivery attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Records buffered between `publish` and the delivery worker.
const QUEUE_CAPACITY: usize = 64;

/// Per-request timeout for the HTTP delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` lets the worker drain before queued records are dropped.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// A telemetry ingestion endpoint.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Bring the sink up.  Publishing before `start` fails.
    async fn start(&mut self) -> Result<(), BridgeError>;

    /// Hand `record` over for delivery on `channel` without waiting for
    /// acknowledgement.
    async fn publish(&mut self, channel: &str, record: &WireRecord, qos: Qos) -> Result<(), BridgeError>;

    /// Stop delivering, flushing what was already handed over.
    async fn stop(&mut self);

    /// Drop the connection to the endpoint.
    async fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// ThingsBoard HTTP sink
// ---------------------------------------------------------------------------

struct Outgoing {
    endpoint: &'static str,
    body: serde_json::Value,
    qos: Qos,
}

struct Worker {
    queue: mpsc::Sender<Outgoing>,
    handle: JoinHandle<()>,
}

/// ThingsBoard device API over HTTP.
///
/// Records are POSTed to `<base_url>/api/v1/<token>/telemetry` (or
/// `/attributes` for the attributes channel).  The access token is part of
/// the URL, so URLs are never logged.
pub struct ThingsboardSink {
    base_url: String,
    token: SecretToken,
    client: Option<reqwest::Client>,
    flush_grace: Duration,
    worker: Option<Worker>,
}

impl ThingsboardSink {
    /// `host` is either a bare host name (`demo.thingsboard.io`, reached over
    /// HTTPS) or a full base URL (`http://localhost:8080`).
    pub fn new(host: &str, token: SecretToken) -> Self {
        Self {
            base_url: base_url_for(host),
            token,
            client: None,
            flush_grace: FLUSH_GRACE,
            worker: None,
        }
    }
}

/// Normalise a configured sink host into a base URL without trailing slash.
pub fn base_url_for(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Map an MQTT-style device channel onto the HTTP API endpoint.
pub fn endpoint_for(channel: &str) -> Result<&'static str, BridgeError> {
    match channel.trim_end_matches('/').rsplit('/').next() {
        Some("telemetry") => Ok("telemetry"),
        Some("attributes") => Ok("attributes"),
        _ => Err(BridgeError::SinkPublishFailure(format!(
            "unsupported sink channel {channel:?}"
        ))),
    }
}

#[async_trait]
impl TelemetrySink for ThingsboardSink {
    async fn start(&mut self) -> Result<(), BridgeError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = reqwest::Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .map_err(|e| BridgeError::ConnectionFailure(format!("sink client: {e}")))?;
                self.client = Some(client.clone());
                client
            }
        };
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        let url_prefix = format!("{}/api/v1/{}", self.base_url, self.token.expose());
        let handle = tokio::spawn(deliver(client, url_prefix, rx));
        self.worker = Some(Worker { queue, handle });
        debug!(base_url = %self.base_url, "thingsboard sink started");
        Ok(())
    }

    async fn publish(&mut self, channel: &str, record: &WireRecord, qos: Qos) -> Result<(), BridgeError> {
        let endpoint = endpoint_for(channel)?;
        let Some(worker) = &self.worker else {
            return Err(BridgeError::SinkPublishFailure("sink is not started".to_string()));
        };
        let outgoing = Outgoing {
            endpoint,
            body: record.as_value().clone(),
            qos,
        };
        worker.queue.try_send(outgoing).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BridgeError::SinkPublishFailure("delivery queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BridgeError::SinkPublishFailure("delivery worker has stopped".to_string())
            }
        })
    }

    async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.queue);
            let mut handle = worker.handle;
            match tokio::time::timeout(self.flush_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "thingsboard delivery worker ended abnormally"),
                Err(_) => {
                    warn!(grace = ?self.flush_grace, "thingsboard delivery did not drain in time, dropping queued records");
                    handle.abort();
                }
            }
            debug!(base_url = %self.base_url, "thingsboard sink stopped");
        }
    }

    async fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
        self.client = None;
    }
}

/// Drain `rx`, POSTing every record.  Ends when the queue is closed and empty.
async fn deliver(client: reqwest::Client, url_prefix: String, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        let attempts = match outgoing.qos {
            Qos::AtMostOnce => 1,
            Qos::AtLeastOnce => AT_LEAST_ONCE_ATTEMPTS,
        };
        let url = format!("{url_prefix}/{}", outgoing.endpoint);
        for attempt in 1..=attempts {
            let result = client
                .post(&url)
                .json(&outgoing.body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match result {
                Ok(_) => break,
                Err(e) => {
                    // `without_url` keeps the access token out of the log.
                    let e = e.without_url();
                    if attempt == attempts {
                        warn!(endpoint = outgoing.endpoint, attempts, error = %e, "dropping telemetry record");
                    } else {
                        debug!(endpoint = outgoing.endpoint, attempt, error = %e, "telemetry delivery failed, retrying");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// One record captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub record: WireRecord,
    pub qos: Qos,
}

#[derive(Default)]
struct MemoryState {
    started: bool,
    stopped: bool,
    disconnected: bool,
    fail_start: bool,
    records: Vec<Published>,
}

/// Sink that keeps every published record in memory.
///
/// Clones share state, so a handle kept outside a stream task observes what
/// the task published and whether it released the sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `start` fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn records(&self) -> Vec<Published> {
        self.state.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn start(&mut self) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(BridgeError::ConnectionFailure("memory sink refused to start".to_string()));
        }
        state.started = true;
        state.stopped = false;
        state.disconnected = false;
        Ok(())
    }

    async fn publish(&mut self, channel: &str, record: &WireRecord, qos: Qos) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        if !state.started || state.stopped {
            return Err(BridgeError::SinkPublishFailure("memory sink is not running".to_string()));
        }
        state.records.push(Published {
            channel: channel.to_string(),
            record: record.clone(),
            qos,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        self.state.lock().stopped = true;
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.started = false;
        state.disconnected = true;
    }
}

/// Releases like a [`MemorySink`] but panics on every publish.
#[cfg(test)]
pub(crate) struct PanickingSink(pub(crate) MemorySink);

#[cfg(test)]
#[async_trait]
impl TelemetrySink for PanickingSink {
    async fn start(&mut self) -> Result<(), BridgeError> {
        self.0.start().await
    }

    async fn publish(&mut self, _: &str, _: &WireRecord, _: Qos) -> Result<(), BridgeError> {
        panic!("sink exploded");
    }

    async fn stop(&mut self) {
        self.0.stop().await;
    }

    async fn disconnect(&mut self) {
        self.0.disconnect().await;
    }
}
