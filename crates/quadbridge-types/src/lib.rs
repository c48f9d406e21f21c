//! Shared data model for the quadbridge workspace.
//!
//! Everything that crosses a crate boundary lives here: the opaque
//! [`Message`] delivered by the robot's topic channel, the static
//! [`DeviceDescriptor`] read by every stream task, the sink-ready
//! [`WireRecord`], and the workspace-wide [`BridgeError`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A structured payload delivered under a topic.
///
/// Usually a JSON object (string keys mapped to numbers, strings, nested
/// objects and arrays). Immutable once delivered.
pub type Message = serde_json::Value;

/// Well-known topics on the robot's data channel.
pub mod topics {
    /// Low-level robot state: IMU, motors, BMS, foot force.
    pub const LOW_STATE: &str = "rt/lf/lowstate";
    /// High-level sport-mode state.
    pub const SPORT_MODE_STATE: &str = "rt/lf/sportmodestate";
    /// Request topic for sport-mode commands.
    pub const SPORT_REQUEST: &str = "rt/api/sport/request";
}

/// Sink channel the telemetry records are published under.
pub const DEFAULT_SINK_CHANNEL: &str = "v1/devices/me/telemetry";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One-shot sport-mode commands issued through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SportCommand {
    StandUp,
    StandDown,
}

impl SportCommand {
    /// Numeric API identifier understood by the robot.
    pub fn api_id(self) -> u32 {
        match self {
            SportCommand::StandUp => 1004,
            SportCommand::StandDown => 1005,
        }
    }

    /// Request payload published on [`topics::SPORT_REQUEST`].
    pub fn payload(self) -> Message {
        serde_json::json!({ "api_id": self.api_id() })
    }
}

impl fmt::Display for SportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SportCommand::StandUp => write!(f, "stand_up"),
            SportCommand::StandDown => write!(f, "stand_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// The reshaping a device applies to each raw state sample before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// Forward the sample unchanged.
    #[default]
    Raw,
    /// Four foot-force readings renamed per leg.
    FootForce,
    /// The nested battery-management sub-mapping.
    BmsState,
    /// IMU roll/pitch/yaw renamed into named fields.
    Orientation,
}

impl TelemetryKind {
    /// All kinds, in declaration order.
    pub const ALL: [TelemetryKind; 4] = [
        TelemetryKind::Raw,
        TelemetryKind::FootForce,
        TelemetryKind::BmsState,
        TelemetryKind::Orientation,
    ];
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryKind::Raw => write!(f, "raw"),
            TelemetryKind::FootForce => write!(f, "foot_force"),
            TelemetryKind::BmsState => write!(f, "bms_state"),
            TelemetryKind::Orientation => write!(f, "orientation"),
        }
    }
}

/// Flat, sink-ready telemetry shape produced by the transform layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WireRecord(Message);

impl WireRecord {
    pub fn new(value: Message) -> Self {
        Self(value)
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Message> {
        self.0.get(field)
    }

    pub fn as_value(&self) -> &Message {
        &self.0
    }

    pub fn into_value(self) -> Message {
        self.0
    }
}

/// Delivery guarantee requested from the sink for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Sink credential. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw credential for the one place that needs it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<not set>")
        } else {
            f.write_str("<redacted>")
        }
    }
}

fn default_telemetry_topic() -> String {
    topics::LOW_STATE.to_string()
}

/// Static per-device configuration. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Identity used in logs, status and reports.
    pub id: String,
    /// Channel connection target, e.g. `ws://192.168.100.101:8081/channel`.
    pub target: String,
    /// Per-device sink credential.
    pub sink_token: SecretToken,
    /// How samples are reshaped before publishing.
    #[serde(default)]
    pub kind: TelemetryKind,
    /// Topic the stream task samples.
    #[serde(default = "default_telemetry_topic")]
    pub topic: String,
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        sink_token: SecretToken,
        kind: TelemetryKind,
    ) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            sink_token,
            kind,
            topic: default_telemetry_topic(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type shared by every quadbridge crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("No message on {topic} within {timeout:?}")]
    TimedOut { topic: String, timeout: Duration },

    #[error("Malformed sample: {0}")]
    MalformedSample(String),

    #[error("Sink publish failure: {0}")]
    SinkPublishFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Errors a stream loop reports and steps past instead of exiting on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::TimedOut { .. }
                | BridgeError::MalformedSample(_)
                | BridgeError::SinkPublishFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sport_command_payload_carries_api_id() {
        assert_eq!(SportCommand::StandUp.payload(), serde_json::json!({ "api_id": 1004 }));
        assert_eq!(SportCommand::StandDown.payload(), serde_json::json!({ "api_id": 1005 }));
    }

    #[test]
    fn secret_token_debug_is_redacted() {
        let token = SecretToken::new("ACCESS_TOKEN_1");
        assert_eq!(format!("{token:?}"), "<redacted>");
        assert_eq!(format!("{:?}", SecretToken::new("")), "<not set>");
        assert_eq!(token.expose(), "ACCESS_TOKEN_1");
    }

    #[test]
    fn descriptor_debug_hides_token() {
        let device = DeviceDescriptor::new(
            "dev-1",
            "ws://127.0.0.1:9000",
            SecretToken::new("super-secret"),
            TelemetryKind::FootForce,
        );
        let debug = format!("{device:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let device: DeviceDescriptor = toml::from_str(
            r#"
            id = "dev-3"
            target = "ws://192.168.100.101:9000"
            sink_token = "ACCESS_TOKEN_3"
            "#,
        )
        .unwrap();
        assert_eq!(device.kind, TelemetryKind::Raw);
        assert_eq!(device.topic, topics::LOW_STATE);
        assert_eq!(device.sink_token.expose(), "ACCESS_TOKEN_3");
    }

    #[test]
    fn telemetry_kind_uses_snake_case_names() {
        let device: DeviceDescriptor = toml::from_str(
            r#"
            id = "dev-4"
            target = "ws://robot"
            sink_token = "t"
            kind = "orientation"
            "#,
        )
        .unwrap();
        assert_eq!(device.kind, TelemetryKind::Orientation);
        assert_eq!(TelemetryKind::BmsState.to_string(), "bms_state");
    }

    #[test]
    fn recoverable_classification() {
        let timeout = BridgeError::TimedOut {
            topic: topics::LOW_STATE.to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_recoverable());
        assert!(BridgeError::MalformedSample("x".into()).is_recoverable());
        assert!(!BridgeError::ConnectionFailure("refused".into()).is_recoverable());
        assert!(!BridgeError::ChannelClosed("eof".into()).is_recoverable());
    }

    #[test]
    fn timed_out_display_names_topic() {
        let err = BridgeError::TimedOut {
            topic: "rt/lf/lowstate".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("rt/lf/lowstate"));
    }
}
