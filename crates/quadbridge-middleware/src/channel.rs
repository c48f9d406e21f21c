//! The Topic Channel seam.
//!
//! Nothing above this crate speaks a transport directly.  Stream tasks and
//! the command facade hold a [`TopicChannel`] and only ever connect, publish
//! a request, subscribe/unsubscribe a callback, and close.
//!
//! # Implementations
//!
//! - [`WsTopicChannel`][crate::ws_channel::WsTopicChannel] – JSON envelopes
//!   over a WebSocket to the robot's data-channel relay.
//! - [`LoopbackChannel`][crate::loopback::LoopbackChannel] – in-process
//!   channel used by tests and local tooling.

use async_trait::async_trait;
use quadbridge_types::{BridgeError, Message};

use crate::registry::{Callback, SubscriptionId};

/// A single multiplexed transport delivering topic-tagged messages.
///
/// # Contract
///
/// * Messages on one topic reach each active callback exactly once and in
///   order; no ordering holds across topics.
/// * `subscribe`/`unsubscribe` are synchronous so they can run from a
///   destructor; an implementation defers any remote bookkeeping.
/// * `close` is idempotent and safe on a channel that never connected.
#[async_trait]
pub trait TopicChannel: Send + Sync {
    /// Open the connection.  Calling it on an open channel is a no-op.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Publish a request payload on `topic` without waiting for a reply.
    async fn publish_request(&self, topic: &str, payload: Message) -> Result<(), BridgeError>;

    /// Register `callback` for every message delivered on `topic`.
    fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionId;

    /// Remove a callback previously returned by [`subscribe`][Self::subscribe].
    fn unsubscribe(&self, topic: &str, id: SubscriptionId);

    /// Number of callbacks currently registered on `topic`.
    fn subscriber_count(&self, topic: &str) -> usize;

    /// `true` while the underlying link is usable.
    fn is_open(&self) -> bool;

    /// Release the connection.
    async fn close(&self);
}
