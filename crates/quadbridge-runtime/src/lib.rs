//! `quadbridge-runtime` – The Stream Engine
//!
//! Moves state samples from each robot to its telemetry sink, one task per
//! device, and keeps the fleet running when a single device fails.
//!
//! # Modules
//!
//! - [`transform`] – [`transform`][transform::transform]: pure reshaping of
//!   a raw sample into a [`WireRecord`][quadbridge_types::WireRecord] per
//!   [`TelemetryKind`][quadbridge_types::TelemetryKind].
//! - [`sink`] – the [`TelemetrySink`] seam, the ThingsBoard HTTP sink and an
//!   in-memory sink.
//! - [`device_task`] – [`DeviceStreamTask`]: connect, sample, transform,
//!   publish, sleep; releases its channel and sink on every exit.
//! - [`supervisor`] – [`StreamSupervisor`]: one task per device, failure
//!   containment, restart policy, cancellation barrier.
//! - [`status`] – [`FleetStatus`]: live per-device state and counters.
//! - [`connector`] – [`DeviceConnector`]: builds each device's owned
//!   channel and sink.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP export.
//!
//! # Ownership
//!
//! Device descriptors are shared read-only as `Arc<DeviceDescriptor>`.
//! Channels and sinks are never shared: the connector builds a fresh pair
//! for every (re)start of a device and the task owns it until it returns.

pub mod connector;
pub mod device_task;
pub mod sink;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod transform;

pub use connector::{DeviceConnector, LiveConnector};
pub use device_task::{DEFAULT_PUBLISH_INTERVAL, DeviceStreamTask, StreamSettings, StreamSummary};
pub use sink::{MemorySink, TelemetrySink, ThingsboardSink};
pub use status::{DeviceStatus, FleetStatus, StreamState, TaskOutcome};
pub use supervisor::{DeviceReport, FleetReport, RestartPolicy, StreamSupervisor};
pub use telemetry::{TracerProviderGuard, init_tracing};
