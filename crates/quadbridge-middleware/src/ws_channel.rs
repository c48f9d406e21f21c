//! WebSocket client for the robot's data channel.
//!
//! [`WsTopicChannel`] connects to a data-channel relay and exchanges JSON
//! envelopes with it:
//!
//! | Direction | Envelope |
//! |---|---|
//! | out | `{"type":"subscribe","topic":T}` / `{"type":"unsubscribe","topic":T}` |
//! | out | `{"type":"req","topic":T,"data":{"header":{"identity":{"id":N,"api_id":A}},"parameter":P}}` |
//! | in  | `{"type":"msg","topic":T,"data":D}` – `D` is the delivered [`Message`] |
//!
//! Local callbacks live in a [`SubscriberRegistry`]; the relay only hears a
//! subscribe frame for the first local callback on a topic and an
//! unsubscribe frame when the last one leaves.  Topics with live callbacks
//! are re-announced after a reconnect.
//!
//! Two background tasks serve an open link: a writer draining an outbound
//! queue (so `subscribe`/`unsubscribe` stay synchronous) and a reader routing
//! inbound frames.  When the reader stops the channel reports
//! [`is_open`][TopicChannel::is_open] `== false`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use quadbridge_types::{BridgeError, Message};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::channel::TopicChannel;
use crate::registry::{Callback, SubscriberRegistry, SubscriptionId};

/// How long `close` waits for queued frames to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on dialling the relay and completing the upgrade.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request ids stay within a signed 32-bit range on the robot side.
const REQUEST_ID_MODULUS: u64 = 1 << 31;

struct Link {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Topic channel over a WebSocket data-channel relay.
pub struct WsTopicChannel {
    url: String,
    registry: Arc<SubscriberRegistry>,
    link: Mutex<Option<Link>>,
    open: Arc<AtomicBool>,
    next_request_id: AtomicU64,
    connect_timeout: Duration,
}

impl WsTopicChannel {
    /// Create a channel for `url` (e.g. `ws://192.168.100.101:8081/channel`).
    /// Nothing is dialled until [`connect`][TopicChannel::connect].
    pub fn new(url: impl Into<String>) -> Self {
        let seed = Utc::now().timestamp_millis().unsigned_abs() % REQUEST_ID_MODULUS;
        Self {
            url: url.into(),
            registry: Arc::new(SubscriberRegistry::new()),
            link: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            next_request_id: AtomicU64::new(seed),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Queue a frame on the current link.  Returns `false` without a link.
    fn send_frame(&self, frame: &Value) -> bool {
        let link = self.link.lock();
        match link.as_ref() {
            Some(link) => link
                .outbound
                .send(WsMessage::Text(frame.to_string().into()))
                .is_ok(),
            None => false,
        }
    }

    /// Abort whatever is left of a previous link.
    fn teardown(&self) {
        if let Some(link) = self.link.lock().take() {
            link.reader.abort();
            link.writer.abort();
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) % REQUEST_ID_MODULUS
    }
}

impl Drop for WsTopicChannel {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
            link.writer.abort();
        }
    }
}

#[async_trait]
impl TopicChannel for WsTopicChannel {
    async fn connect(&self) -> Result<(), BridgeError> {
        if self.is_open() {
            return Ok(());
        }
        self.teardown();

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                BridgeError::ConnectionFailure(format!(
                    "{}: connect timed out after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| BridgeError::ConnectionFailure(format!("{}: {e}", self.url)))?;
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        self.open.store(true, Ordering::SeqCst);

        let registry = Arc::clone(&self.registry);
        let open = Arc::clone(&self.open);
        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if let Err(e) = route_inbound(&registry, text.as_str()) {
                            debug!(url = %url, error = %e, "dropping inbound frame");
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(url = %url, error = %e, "data channel read error");
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
            debug!(url = %url, "data channel reader finished");
        });

        for topic in self.registry.topics() {
            let _ = outbound.send(WsMessage::Text(subscribe_frame(&topic).to_string().into()));
        }

        *self.link.lock() = Some(Link {
            outbound,
            reader,
            writer,
        });
        info!(url = %self.url, "data channel connected");
        Ok(())
    }

    async fn publish_request(&self, topic: &str, payload: Message) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed(format!(
                "cannot publish on {topic}: {} is not connected",
                self.url
            )));
        }
        let frame = request_frame(topic, self.next_request_id(), &payload)?;
        if !self.send_frame(&frame) {
            return Err(BridgeError::ChannelClosed(format!(
                "cannot publish on {topic}: link to {} is gone",
                self.url
            )));
        }
        debug!(topic, "request queued");
        Ok(())
    }

    fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionId {
        let (id, first) = self.registry.add(topic, callback);
        if first {
            self.send_frame(&subscribe_frame(topic));
        }
        id
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if self.registry.remove(topic, id) {
            self.send_frame(&unsubscribe_frame(topic));
        }
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.count(topic)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let Some(link) = self.link.lock().take() else {
            return;
        };
        drop(link.outbound);
        let mut writer = link.writer;
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            warn!(url = %self.url, "data channel writer did not flush in time");
            writer.abort();
        }
        link.reader.abort();
        info!(url = %self.url, "data channel closed");
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

pub(crate) fn subscribe_frame(topic: &str) -> Value {
    json!({ "type": "subscribe", "topic": topic })
}

pub(crate) fn unsubscribe_frame(topic: &str) -> Value {
    json!({ "type": "unsubscribe", "topic": topic })
}

/// Wrap a `{"api_id": A, "parameter"?: P}` payload into a request envelope.
///
/// An object `parameter` is sent JSON-encoded, a string one verbatim, and a
/// missing one as the empty string.
pub(crate) fn request_frame(topic: &str, id: u64, payload: &Message) -> Result<Value, BridgeError> {
    let api_id = payload
        .get("api_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            BridgeError::Serialization(format!("request on {topic} has no numeric api_id"))
        })?;
    let parameter = match payload.get("parameter") {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(other) => Value::String(other.to_string()),
    };
    Ok(json!({
        "type": "req",
        "topic": topic,
        "data": {
            "header": { "identity": { "id": id, "api_id": api_id } },
            "parameter": parameter,
        }
    }))
}

/// Route one inbound text frame.  Returns the number of callbacks reached.
pub(crate) fn route_inbound(registry: &SubscriberRegistry, text: &str) -> Result<usize, BridgeError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| BridgeError::MalformedSample(e.to_string()))?;
    if frame.get("type").and_then(Value::as_str) != Some("msg") {
        return Ok(0);
    }
    let topic = frame
        .get("topic")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::MalformedSample("msg frame without topic".to_string()))?;
    let data = frame.get("data").cloned().unwrap_or(Value::Null);
    Ok(registry.dispatch(topic, &data))
}
