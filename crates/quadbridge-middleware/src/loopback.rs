//! In-process [`TopicChannel`] with no transport behind it.
//!
//! Messages are injected with [`LoopbackChannel::deliver`] and reach the
//! registered callbacks synchronously.  A topic can be *latched*: the latched
//! message is handed to every new subscriber the moment it subscribes, which
//! makes a robot that streams state continuously easy to stand in for.
//!
//! Clone it cheaply – all clones share the same state, so a test can keep a
//! handle while a stream task owns another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use quadbridge_types::{BridgeError, Message};
use tracing::debug;

use crate::channel::TopicChannel;
use crate::registry::{Callback, SubscriberRegistry, SubscriptionId};

#[derive(Default)]
struct Inner {
    registry: SubscriberRegistry,
    open: AtomicBool,
    refuse_connections: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    published: Mutex<Vec<(String, Message)>>,
    latched: Mutex<HashMap<String, Message>>,
}

/// Shared in-process channel.
#[derive(Clone, Default)]
pub struct LoopbackChannel {
    inner: Arc<Inner>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent [`connect`][TopicChannel::connect] fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Drop the link as if the remote end went away.
    pub fn sever(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }

    /// Deliver `message` on `topic` to every current subscriber.
    ///
    /// Returns the number of callbacks reached.
    pub fn deliver(&self, topic: &str, message: Message) -> usize {
        self.inner.registry.dispatch(topic, &message)
    }

    /// Latch `message` on `topic`: every future subscriber receives it on
    /// subscription, and current subscribers receive it now.
    pub fn latch(&self, topic: &str, message: Message) -> usize {
        self.inner
            .latched
            .lock()
            .insert(topic.to_string(), message.clone());
        self.deliver(topic, message)
    }

    /// Stop latching `topic`.
    pub fn unlatch(&self, topic: &str) {
        self.inner.latched.lock().remove(topic);
    }

    /// Every request published so far, oldest first.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.inner.published.lock().clone()
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Callbacks registered across all topics.
    pub fn total_subscribers(&self) -> usize {
        self.inner.registry.total()
    }
}

#[async_trait]
impl TopicChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), BridgeError> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailure(
                "loopback channel refused the connection".to_string(),
            ));
        }
        if !self.inner.open.swap(true, Ordering::SeqCst) {
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn publish_request(&self, topic: &str, payload: Message) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::ChannelClosed(format!(
                "cannot publish on {topic}: loopback channel is not connected"
            )));
        }
        debug!(topic, "loopback request published");
        self.inner
            .published
            .lock()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionId {
        let latched = self.inner.latched.lock().get(topic).cloned();
        let (id, _) = self.inner.registry.add(topic, Arc::clone(&callback));
        if let Some(message) = latched {
            callback(&message);
        }
        id
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        self.inner.registry.remove(topic, id);
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.registry.count(topic)
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}
