//! The Correlator – one topic subscription turned into one awaited value.
//!
//! A [`Waiter`] is a single-use subscription with a deadline and a result
//! slot.  The first message delivered on its topic resolves it; anything
//! after that is ignored.  The callback is unregistered when the waiter is
//! dropped, which covers every exit path: a value, a timeout, and the
//! enclosing future being cancelled mid-wait.
//!
//! [`await_topic`] is the only blocking primitive above the channel.  Every
//! "read one sample" or "read one status" is exactly one call to it.
//!
//! # Concurrent waiters on one topic
//!
//! Two waiters on the same topic are independent subscriptions, so both
//! resolve with the same next message (fan-out).  Callers that need a
//! strictly single outstanding waiter per topic serialise above this layer.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use quadbridge_middleware::{LoopbackChannel, TopicChannel, await_topic};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let channel = LoopbackChannel::new();
//! channel.latch("rt/lf/lowstate", serde_json::json!({ "tick": 1 }));
//!
//! let msg = await_topic(&channel, "rt/lf/lowstate", Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! assert_eq!(msg["tick"], 1);
//! assert_eq!(channel.subscriber_count("rt/lf/lowstate"), 0);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quadbridge_types::{BridgeError, Message};
use tokio::sync::oneshot;
use tracing::trace;

use crate::channel::TopicChannel;
use crate::registry::{Callback, SubscriptionId};

/// Deadline used when a caller has no reason to pick another.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Single-use correlated subscription.
///
/// Registered on construction, unregistered on drop.
pub struct Waiter<'a, C: TopicChannel + ?Sized> {
    channel: &'a C,
    topic: String,
    id: SubscriptionId,
    slot: oneshot::Receiver<Message>,
}

impl<'a, C: TopicChannel + ?Sized> Waiter<'a, C> {
    /// Subscribe to `topic` on `channel` and start collecting.
    ///
    /// A message that arrives before [`wait`][Self::wait] is polled is kept.
    pub fn register(channel: &'a C, topic: &str) -> Self {
        let (tx, slot) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let callback: Callback = Arc::new(move |message: &Message| {
            if let Some(tx) = tx.lock().take() {
                // The receiver may already be gone after a timeout.
                let _ = tx.send(message.clone());
            }
        });
        let id = channel.subscribe(topic, callback);
        trace!(topic, id = id.as_u64(), "waiter registered");
        Self {
            channel,
            topic: topic.to_string(),
            id,
            slot,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Race the first delivered message against `timeout`.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::TimedOut`] when nothing arrives within `timeout`.
    /// * [`BridgeError::ChannelClosed`] when the channel dropped the
    ///   subscription without delivering anything.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, BridgeError> {
        match tokio::time::timeout(timeout, &mut self.slot).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(BridgeError::ChannelClosed(format!(
                "subscription on {} dropped before a message arrived",
                self.topic
            ))),
            Err(_) => Err(BridgeError::TimedOut {
                topic: self.topic.clone(),
                timeout,
            }),
        }
    }
}

impl<C: TopicChannel + ?Sized> Drop for Waiter<'_, C> {
    fn drop(&mut self) {
        self.channel.unsubscribe(&self.topic, self.id);
        trace!(topic = %self.topic, id = self.id.as_u64(), "waiter unregistered");
    }
}

/// Wait for the next message on `topic`, for at most `timeout`.
///
/// The subscription never outlives the call.
pub async fn await_topic<C: TopicChannel + ?Sized>(
    channel: &C,
    topic: &str,
    timeout: Duration,
) -> Result<Message, BridgeError> {
    Waiter::register(channel, topic).wait(timeout).await
}
