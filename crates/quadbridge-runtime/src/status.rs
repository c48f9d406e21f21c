//! Fleet status board.
//!
//! Stream tasks write their progress here; the gateway and the CLI read it.
//! Entries are keyed by device id and kept in id order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use quadbridge_types::{DeviceDescriptor, TelemetryKind};
use serde::Serialize;

/// Lifecycle of one device stream task.
///
/// `Disconnected → Connecting → Streaming ⇄ Error`, ending in `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    /// The last sample was missed; the loop keeps going.
    Error,
    Stopped,
}

/// How a supervised device finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Shut down by the cancellation signal after releasing its resources.
    Cancelled,
    /// Ended on a fatal error with the restart budget exhausted.
    Failed { error: String },
}

impl TaskOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub kind: TelemetryKind,
    pub state: StreamState,
    pub published: u64,
    pub missed: u64,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub outcome: Option<TaskOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    fn new(id: &str, kind: TelemetryKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            state: StreamState::Disconnected,
            published: 0,
            missed: 0,
            restarts: 0,
            last_error: None,
            outcome: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared, cheaply cloneable view of every device's progress.
#[derive(Clone, Default)]
pub struct FleetStatus {
    devices: Arc<RwLock<BTreeMap<String, DeviceStatus>>>,
}

impl FleetStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device in the `Disconnected` state.  Re-registering keeps the
    /// existing entry.
    pub fn register(&self, device: &DeviceDescriptor) {
        self.devices
            .write()
            .entry(device.id.clone())
            .or_insert_with(|| DeviceStatus::new(&device.id, device.kind));
    }

    pub fn set_state(&self, id: &str, state: StreamState) {
        self.update(id, |status| status.state = state);
    }

    pub fn record_published(&self, id: &str) {
        self.update(id, |status| status.published += 1);
    }

    pub fn record_missed(&self, id: &str) {
        self.update(id, |status| status.missed += 1);
    }

    pub fn record_error(&self, id: &str, error: &impl fmt::Display) {
        let message = error.to_string();
        self.update(id, |status| status.last_error = Some(message));
    }

    pub fn record_restart(&self, id: &str) {
        self.update(id, |status| status.restarts += 1);
    }

    pub fn finish(&self, id: &str, outcome: TaskOutcome) {
        self.update(id, |status| {
            status.state = StreamState::Stopped;
            status.outcome = Some(outcome);
        });
    }

    pub fn get(&self, id: &str) -> Option<DeviceStatus> {
        self.devices.read().get(id).cloned()
    }

    /// Every device, ordered by id.
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        self.devices.read().values().cloned().collect()
    }

    // Unknown ids are ignored.
    fn update(&self, id: &str, apply: impl FnOnce(&mut DeviceStatus)) {
        if let Some(status) = self.devices.write().get_mut(id) {
            apply(status);
            status.updated_at = Utc::now();
        }
    }
}
