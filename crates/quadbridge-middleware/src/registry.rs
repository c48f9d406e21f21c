//! Per-topic callback registry shared by every [`TopicChannel`] implementation.
//!
//! The registry is the local half of a subscription: it maps a topic to the
//! callbacks currently interested in it and fans each delivered message out
//! to all of them.  Channel implementations consult the return values of
//! [`SubscriberRegistry::add`] and [`SubscriberRegistry::remove`] to decide
//! when the *remote* side needs a subscribe/unsubscribe frame.
//!
//! [`TopicChannel`]: crate::channel::TopicChannel

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quadbridge_types::Message;

/// Callback invoked for every message delivered on a subscribed topic.
///
/// Delivery happens on the channel's reader context; callbacks must be
/// cheap and must not block.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Thread-safe topic → callbacks table.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` on `topic`.
    ///
    /// Returns the new id and `true` when this is the first callback on the
    /// topic.
    pub fn add(&self, topic: &str, callback: Callback) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((id, callback));
        (id, first)
    }

    /// Remove the callback registered under `id`.
    ///
    /// Returns `true` when the topic has no callbacks left afterwards.
    /// Removing an unknown id is a no-op that returns `false`.
    pub fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(sid, _)| *sid != id);
        if entry.len() == before {
            return false;
        }
        if entry.is_empty() {
            topics.remove(topic);
            return true;
        }
        false
    }

    /// Deliver `message` to every callback on `topic`.
    ///
    /// The callbacks are invoked outside the registry lock so that a
    /// callback may itself subscribe or unsubscribe.  Returns the number of
    /// callbacks invoked.
    pub fn dispatch(&self, topic: &str, message: &Message) -> usize {
        let callbacks: Vec<Callback> = {
            let topics = self.topics.lock();
            match topics.get(topic) {
                Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return 0,
            }
        };
        for callback in &callbacks {
            callback(message);
        }
        callbacks.len()
    }

    /// Number of callbacks currently registered on `topic`.
    pub fn count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Total number of callbacks across all topics.
    pub fn total(&self) -> usize {
        self.topics.lock().values().map(Vec::len).sum()
    }

    /// Topics with at least one callback.  Order is unspecified.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }
}
