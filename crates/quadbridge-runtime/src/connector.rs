//! Builds the per-device channel and sink.
//!
//! The supervisor asks its [`DeviceConnector`] for a fresh pair every time it
//! (re)starts a device, so no channel or sink is ever shared between tasks.

use quadbridge_middleware::{TopicChannel, WsTopicChannel};
use quadbridge_types::DeviceDescriptor;

use crate::sink::{TelemetrySink, ThingsboardSink};

/// Relay port used when a device target is a bare address.
pub const DEFAULT_RELAY_PORT: u16 = 8081;

/// Source of owned channel/sink instances for one device.
pub trait DeviceConnector: Send + Sync + 'static {
    fn open_channel(&self, device: &DeviceDescriptor) -> Box<dyn TopicChannel>;

    fn open_sink(&self, device: &DeviceDescriptor) -> Box<dyn TelemetrySink>;
}

/// WebSocket channel to the robot, ThingsBoard sink for the telemetry.
#[derive(Debug, Clone)]
pub struct LiveConnector {
    sink_host: String,
}

impl LiveConnector {
    pub fn new(sink_host: impl Into<String>) -> Self {
        Self {
            sink_host: sink_host.into(),
        }
    }
}

impl DeviceConnector for LiveConnector {
    fn open_channel(&self, device: &DeviceDescriptor) -> Box<dyn TopicChannel> {
        Box::new(WsTopicChannel::new(channel_url(&device.target)))
    }

    fn open_sink(&self, device: &DeviceDescriptor) -> Box<dyn TelemetrySink> {
        Box::new(ThingsboardSink::new(&self.sink_host, device.sink_token.clone()))
    }
}

/// `192.168.100.101` → `ws://192.168.100.101:8081/channel`; full URLs pass
/// through.
pub fn channel_url(target: &str) -> String {
    let target = target.trim();
    if target.contains("://") {
        target.to_string()
    } else {
        format!("ws://{target}:{DEFAULT_RELAY_PORT}/channel")
    }
}
