//! `quadbridge-middleware` – The Robot Link
//!
//! Turns the robot's callback-driven, topic-multiplexed data channel into
//! something the rest of the bridge can ask a question of and wait on.
//!
//! # Modules
//!
//! - [`channel`] – the [`TopicChannel`] trait every transport implements.
//! - [`registry`] – per-topic callback table with first/last-subscriber
//!   signalling.
//! - [`correlator`] – [`Waiter`] and [`await_topic`]: subscribe, wait with a
//!   deadline, always unsubscribe.
//! - [`ws_channel`] – [`WsTopicChannel`], JSON envelopes over a WebSocket
//!   data-channel relay.
//! - [`loopback`] – [`LoopbackChannel`], an in-process channel with latched
//!   topics.

pub mod channel;
pub mod correlator;
pub mod loopback;
pub mod registry;
pub mod ws_channel;

pub use channel::TopicChannel;
pub use correlator::{DEFAULT_WAIT, Waiter, await_topic};
pub use loopback::LoopbackChannel;
pub use registry::{Callback, SubscriberRegistry, SubscriptionId};
pub use ws_channel::WsTopicChannel;
