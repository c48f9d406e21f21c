//! Device Stream Task – one robot, one channel, one sink.
//!
//! ```text
//! Disconnected → Connecting → Streaming ⇄ Error
//!                    │             │
//!                    └──── Stopped ┘
//! ```
//!
//! Each iteration awaits one sample on the device topic, transforms it for
//! the device's [`TelemetryKind`][quadbridge_types::TelemetryKind], hands it
//! to the sink and sleeps for the publish interval.  A missed sample is
//! counted and skipped.  A failed connect, or a link that drops, ends the
//! task with an error; restarting is the supervisor's business.
//!
//! The sink and the channel are released on every exit, including
//! cancellation and a panic inside the stream.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use quadbridge_middleware::{DEFAULT_WAIT, TopicChannel, await_topic};
use quadbridge_types::{BridgeError, DEFAULT_SINK_CHANNEL, DeviceDescriptor, Message, Qos};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::sink::TelemetrySink;
use crate::status::{FleetStatus, StreamState};
use crate::transform::{has_expected_shape, transform};

/// Default pause between iterations.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

/// Loop parameters shared by every device in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub publish_interval: Duration,
    /// Deadline for one sample.  Per wait, never cumulative.
    pub sample_timeout: Duration,
    pub sink_channel: String,
    pub qos: Qos,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            sample_timeout: DEFAULT_WAIT,
            sink_channel: DEFAULT_SINK_CHANNEL.to_string(),
            qos: Qos::AtLeastOnce,
        }
    }
}

/// Counters for one run of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub published: u64,
    pub missed: u64,
}

/// Owns one device's channel and sink for its whole lifetime.
pub struct DeviceStreamTask {
    device: Arc<DeviceDescriptor>,
    channel: Box<dyn TopicChannel>,
    sink: Box<dyn TelemetrySink>,
    settings: Arc<StreamSettings>,
    status: FleetStatus,
    summary: StreamSummary,
}

impl DeviceStreamTask {
    pub fn new(
        device: Arc<DeviceDescriptor>,
        channel: Box<dyn TopicChannel>,
        sink: Box<dyn TelemetrySink>,
        settings: Arc<StreamSettings>,
    ) -> Self {
        Self {
            device,
            channel,
            sink,
            settings,
            status: FleetStatus::new(),
            summary: StreamSummary::default(),
        }
    }

    /// Report progress to `status` (builder-style).  The device is
    /// registered on it.
    pub fn with_status(mut self, status: FleetStatus) -> Self {
        status.register(&self.device);
        self.status = status;
        self
    }

    /// Stream until `cancel` fires or a fatal error occurs.
    ///
    /// Returns the counters on cancellation.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::ConnectionFailure`] when the channel or the sink
    ///   cannot be opened.
    /// * [`BridgeError::ChannelClosed`] when the link drops mid-stream.
    ///
    /// # Panics
    ///
    /// A panic raised while streaming is resumed once the sink and the
    /// channel have been released.
    #[instrument(name = "device_stream", skip_all, fields(device = %self.device.id, kind = %self.device.kind))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<StreamSummary, BridgeError> {
        let streamed = AssertUnwindSafe(self.stream(&cancel)).catch_unwind().await;
        let outcome = match streamed {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = format!("stream task panicked: {}", panic_message(payload.as_ref()));
                error!(error = %message, "releasing device after panic");
                self.status.record_error(&self.device.id, &message);
                self.release().await;
                self.enter(StreamState::Stopped);
                panic::resume_unwind(payload);
            }
        };
        if let Err(e) = &outcome {
            self.status.record_error(&self.device.id, e);
        }
        self.release().await;
        self.enter(StreamState::Stopped);
        outcome
    }

    async fn stream(&mut self, cancel: &CancellationToken) -> Result<StreamSummary, BridgeError> {
        self.enter(StreamState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.open() => Some(opened),
        };
        match opened {
            None => return Ok(self.summary),
            Some(result) => result?,
        }
        info!(target_url = %self.device.target, topic = %self.device.topic, "streaming");
        self.enter(StreamState::Streaming);

        loop {
            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                sample = await_topic(
                    self.channel.as_ref(),
                    &self.device.topic,
                    self.settings.sample_timeout,
                ) => Some(sample),
            };
            match sample {
                None => break,
                Some(Ok(raw)) => self.publish(&raw).await,
                Some(Err(e)) if !self.channel.is_open() => {
                    return Err(BridgeError::ChannelClosed(format!(
                        "link to {} lost: {e}",
                        self.device.target
                    )));
                }
                Some(Err(e)) if e.is_recoverable() => self.miss(&e),
                Some(Err(e)) => return Err(e),
            }

            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(self.settings.publish_interval) => true,
            };
            if !slept {
                break;
            }
        }
        debug!(published = self.summary.published, missed = self.summary.missed, "stream cancelled");
        Ok(self.summary)
    }

    /// Start the sink, then connect the channel.
    async fn open(&mut self) -> Result<(), BridgeError> {
        self.sink.start().await?;
        self.channel.connect().await
    }

    async fn publish(&mut self, raw: &Message) {
        let kind = self.device.kind;
        if !has_expected_shape(kind, raw) {
            let degraded = BridgeError::MalformedSample(format!("sample lacks the {kind} fields"));
            debug!(error = %degraded, "publishing zero-filled record");
        }
        let record = transform(kind, raw);
        match self
            .sink
            .publish(&self.settings.sink_channel, &record, self.settings.qos)
            .await
        {
            Ok(()) => {
                self.summary.published += 1;
                self.status.record_published(&self.device.id);
                self.enter(StreamState::Streaming);
            }
            Err(e) => {
                warn!(error = %e, "publish failed");
                self.status.record_error(&self.device.id, &e);
                self.enter(StreamState::Error);
            }
        }
    }

    fn miss(&mut self, error: &BridgeError) {
        warn!(error = %error, "sample missed");
        self.summary.missed += 1;
        self.status.record_missed(&self.device.id);
        self.status.record_error(&self.device.id, error);
        self.enter(StreamState::Error);
    }

    async fn release(&mut self) {
        self.sink.stop().await;
        self.sink.disconnect().await;
        self.channel.close().await;
        debug!("device resources released");
    }

    fn enter(&self, state: StreamState) {
        self.status.set_state(&self.device.id, state);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
