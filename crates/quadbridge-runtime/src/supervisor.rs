//! Stream Supervisor – runs one [`DeviceStreamTask`] per device.
//!
//! Every device is supervised in its own task.  A device task that returns
//! an error or panics is contained at that boundary: the failure is
//! recorded, the task may be restarted after a backoff, and sibling devices
//! never notice.  Cancelling the token handed to [`StreamSupervisor::run`]
//! reaches every device; `run` returns only after each one has released its
//! channel and sink.  Dropping the `run` future stops every device too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quadbridge_types::DeviceDescriptor;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connector::DeviceConnector;
use crate::device_task::{DeviceStreamTask, StreamSettings, panic_message};
use crate::status::{FleetStatus, TaskOutcome};

/// How often, and after how long, a failed device is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    /// Report the first failure as final.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    pub restarts: u32,
    pub published: u64,
    pub missed: u64,
}

/// Final result of a supervised run, one entry per device in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetReport {
    pub devices: Vec<DeviceReport>,
}

impl FleetReport {
    pub fn get(&self, id: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|report| report.id == id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices.iter().filter(|report| report.outcome.is_failed())
    }

    /// `true` when no device failed.
    pub fn is_clean(&self) -> bool {
        self.failed().next().is_none()
    }
}

pub struct StreamSupervisor<C> {
    connector: Arc<C>,
    settings: Arc<StreamSettings>,
    policy: RestartPolicy,
    status: FleetStatus,
}

impl<C: DeviceConnector> StreamSupervisor<C> {
    pub fn new(connector: C, settings: StreamSettings) -> Self {
        Self {
            connector: Arc::new(connector),
            settings: Arc::new(settings),
            policy: RestartPolicy::default(),
            status: FleetStatus::new(),
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish progress on an existing board, e.g. one the gateway serves.
    pub fn with_status(mut self, status: FleetStatus) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> FleetStatus {
        self.status.clone()
    }

    /// Stream every device until all of them end or `cancel` fires.
    pub async fn run(&self, devices: &[Arc<DeviceDescriptor>], cancel: CancellationToken) -> FleetReport {
        let fleet = cancel.child_token();
        let _stop_on_drop = fleet.clone().drop_guard();
        let mut set = JoinSet::new();
        let mut owners = HashMap::new();
        for device in devices {
            self.status.register(device);
            let handle = set.spawn(supervise(
                Arc::clone(&self.connector),
                Arc::clone(device),
                Arc::clone(&self.settings),
                self.policy,
                self.status.clone(),
                fleet.child_token(),
            ));
            owners.insert(handle.id(), device.id.clone());
        }
        info!(devices = devices.len(), "fleet started");

        let mut outcomes = HashMap::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    if let Some(device_id) = owners.remove(&task_id) {
                        outcomes.insert(device_id, outcome);
                    }
                }
                Err(e) => {
                    let Some(device_id) = owners.remove(&e.id()) else {
                        continue;
                    };
                    error!(device = %device_id, error = %e, "supervision task ended abnormally");
                    let outcome = TaskOutcome::Failed {
                        error: format!("supervision task ended abnormally: {e}"),
                    };
                    self.status.finish(&device_id, outcome.clone());
                    outcomes.insert(device_id, outcome);
                }
            }
        }

        let report = FleetReport {
            devices: devices
                .iter()
                .map(|device| self.report_for(&device.id, &mut outcomes))
                .collect(),
        };
        info!(
            devices = report.devices.len(),
            failed = report.failed().count(),
            "fleet stopped"
        );
        report
    }

    fn report_for(&self, id: &str, outcomes: &mut HashMap<String, TaskOutcome>) -> DeviceReport {
        let status = self.status.get(id);
        DeviceReport {
            id: id.to_string(),
            outcome: outcomes.remove(id).unwrap_or(TaskOutcome::Cancelled),
            restarts: status.as_ref().map_or(0, |s| s.restarts),
            published: status.as_ref().map_or(0, |s| s.published),
            missed: status.as_ref().map_or(0, |s| s.missed),
        }
    }
}

/// Run one device under `policy` until it is cancelled or out of restarts.
async fn supervise<C: DeviceConnector>(
    connector: Arc<C>,
    device: Arc<DeviceDescriptor>,
    settings: Arc<StreamSettings>,
    policy: RestartPolicy,
    status: FleetStatus,
    cancel: CancellationToken,
) -> TaskOutcome {
    // The stream task is detached; an aborted supervise must still stop it.
    let _stop_on_drop = cancel.clone().drop_guard();
    let mut restarts = 0;
    loop {
        let task = DeviceStreamTask::new(
            Arc::clone(&device),
            connector.open_channel(&device),
            connector.open_sink(&device),
            Arc::clone(&settings),
        )
        .with_status(status.clone());

        // A separate task so a panic inside the stream stays here.
        let error = match tokio::spawn(task.run(cancel.clone())).await {
            Ok(Ok(summary)) => {
                info!(
                    device = %device.id,
                    published = summary.published,
                    missed = summary.missed,
                    "device stopped"
                );
                return conclude(&status, &device.id, TaskOutcome::Cancelled);
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => {
                format!("stream task panicked: {}", panic_message(e.into_panic().as_ref()))
            }
            Err(e) => format!("stream task aborted: {e}"),
        };

        if cancel.is_cancelled() {
            return conclude(&status, &device.id, TaskOutcome::Cancelled);
        }
        if restarts >= policy.max_restarts {
            error!(device = %device.id, restarts, error = %error, "device failed");
            return conclude(&status, &device.id, TaskOutcome::Failed { error });
        }
        restarts += 1;
        status.record_restart(&device.id);
        warn!(
            device = %device.id,
            attempt = restarts,
            backoff = ?policy.backoff,
            error = %error,
            "restarting device"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return conclude(&status, &device.id, TaskOutcome::Cancelled);
            }
            _ = tokio::time::sleep(policy.backoff) => {}
        }
    }
}

fn conclude(status: &FleetStatus, id: &str, outcome: TaskOutcome) -> TaskOutcome {
    status.finish(id, outcome.clone());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, PanickingSink, TelemetrySink};
    use crate::status::StreamState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use quadbridge_middleware::{Callback, LoopbackChannel, SubscriptionId, TopicChannel};
    use quadbridge_types::{BridgeError, Message, SecretToken, TelemetryKind, topics};
    use serde_json::json;

    /// Hands out clones of pre-built loopback channels and memory sinks.
    #[derive(Default)]
    struct FakeConnector {
        pairs: HashMap<String, (LoopbackChannel, MemorySink)>,
        opened: Mutex<HashMap<String, u32>>,
        exploding: Vec<String>,
        panicking_sinks: Vec<String>,
    }

    impl FakeConnector {
        fn add(&mut self, id: &str) -> (LoopbackChannel, MemorySink) {
            let pair = (LoopbackChannel::new(), MemorySink::new());
            self.pairs.insert(id.to_string(), pair.clone());
            pair
        }

        fn opened(&self, id: &str) -> u32 {
            self.opened.lock().get(id).copied().unwrap_or(0)
        }
    }

    impl DeviceConnector for FakeConnector {
        fn open_channel(&self, device: &DeviceDescriptor) -> Box<dyn TopicChannel> {
            *self.opened.lock().entry(device.id.clone()).or_default() += 1;
            if self.exploding.contains(&device.id) {
                return Box::new(ExplodingChannel);
            }
            Box::new(self.pairs[&device.id].0.clone())
        }

        fn open_sink(&self, device: &DeviceDescriptor) -> Box<dyn TelemetrySink> {
            let sink = self
                .pairs
                .get(&device.id)
                .map_or_else(MemorySink::new, |(_, sink)| sink.clone());
            if self.panicking_sinks.contains(&device.id) {
                return Box::new(PanickingSink(sink));
            }
            Box::new(sink)
        }
    }

    /// Channel whose connect panics.
    struct ExplodingChannel;

    #[async_trait]
    impl TopicChannel for ExplodingChannel {
        async fn connect(&self) -> Result<(), BridgeError> {
            panic!("driver blew up");
        }
        async fn publish_request(&self, _: &str, _: Message) -> Result<(), BridgeError> {
            Ok(())
        }
        fn subscribe(&self, _: &str, _: Callback) -> SubscriptionId {
            unreachable!("never connected")
        }
        fn unsubscribe(&self, _: &str, _: SubscriptionId) {}
        fn subscriber_count(&self, _: &str) -> usize {
            0
        }
        fn is_open(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    fn fleet(count: usize) -> Vec<Arc<DeviceDescriptor>> {
        (1..=count)
            .map(|n| {
                Arc::new(DeviceDescriptor::new(
                    format!("dog-{n}"),
                    "loopback",
                    SecretToken::new(format!("token-{n}")),
                    TelemetryKind::ALL[(n - 1) % TelemetryKind::ALL.len()],
                ))
            })
            .collect()
    }

    fn sample() -> Message {
        json!({
            "foot_force": [1, 2, 3, 4],
            "bms_state": { "soc": 80 },
            "imu_state": { "rpy": [0.1, 0.2, 0.3] }
        })
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_device_does_not_disturb_the_fleet() {
        let devices = fleet(4);
        let mut connector = FakeConnector::default();
        let mut handles = Vec::new();
        for device in &devices {
            let (channel, sink) = connector.add(&device.id);
            channel.latch(topics::LOW_STATE, sample());
            handles.push((channel, sink));
        }
        handles[1].0.refuse_connections(true);

        let supervisor = Arc::new(StreamSupervisor::new(connector, StreamSettings::default()).with_policy(policy(1)));
        let status = supervisor.status();
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            let devices = devices.clone();
            let cancel = cancel.clone();
            async move { supervisor.run(&devices, cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!run.is_finished(), "a failed device must not end the run");
        let failed = status.get("dog-2").unwrap();
        assert!(failed.outcome.as_ref().is_some_and(TaskOutcome::is_failed));
        assert_eq!(failed.restarts, 1);
        for id in ["dog-1", "dog-3", "dog-4"] {
            let healthy = status.get(id).unwrap();
            assert_eq!(healthy.state, StreamState::Streaming, "{id}");
            assert_eq!(healthy.published, 4, "{id}");
        }

        cancel.cancel();
        let report = run.await.unwrap();
        assert_eq!(report.failed().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["dog-2"]);
        assert_eq!(report.get("dog-1").unwrap().outcome, TaskOutcome::Cancelled);
        assert_eq!(report.get("dog-3").unwrap().published, 4);
        assert!(handles[1].1.is_empty());
        assert_eq!(supervisor.connector.opened("dog-2"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_every_device_before_returning() {
        let devices = fleet(4);
        let mut connector = FakeConnector::default();
        let mut handles = Vec::new();
        for (index, device) in devices.iter().enumerate() {
            let (channel, sink) = connector.add(&device.id);
            // Half the fleet sits mid-wait on a silent topic.
            if index % 2 == 0 {
                channel.latch(topics::LOW_STATE, sample());
            }
            handles.push((channel, sink));
        }
        let supervisor = StreamSupervisor::new(connector, StreamSettings::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });

        let report = supervisor.run(&devices, cancel).await;

        assert!(report.is_clean());
        assert_eq!(report.devices.len(), 4);
        for (channel, sink) in &handles {
            assert_eq!(channel.close_count(), 1);
            assert!(!channel.is_open());
            assert_eq!(channel.total_subscribers(), 0);
            assert!(sink.is_stopped());
            assert!(sink.is_disconnected());
        }
        for entry in supervisor.status().snapshot() {
            assert_eq!(entry.state, StreamState::Stopped);
            assert_eq!(entry.outcome, Some(TaskOutcome::Cancelled));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_budget_is_honoured() {
        let devices = fleet(1);
        let mut connector = FakeConnector::default();
        let (channel, sink) = connector.add("dog-1");
        channel.refuse_connections(true);
        let supervisor = StreamSupervisor::new(connector, StreamSettings::default()).with_policy(policy(2));

        let report = supervisor.run(&devices, CancellationToken::new()).await;

        let entry = report.get("dog-1").unwrap();
        assert!(entry.outcome.is_failed());
        assert_eq!(entry.restarts, 2);
        assert_eq!(supervisor.connector.opened("dog-1"), 3);
        assert_eq!(channel.close_count(), 3);
        assert!(sink.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn device_recovers_after_restart() {
        let devices = fleet(1);
        let mut connector = FakeConnector::default();
        let (channel, sink) = connector.add("dog-1");
        channel.refuse_connections(true);
        channel.latch(topics::LOW_STATE, sample());
        let supervisor = StreamSupervisor::new(connector, StreamSettings::default()).with_policy(policy(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let robot = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            robot.refuse_connections(false);
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let report = supervisor.run(&devices, cancel).await;

        let entry = report.get("dog-1").unwrap();
        assert_eq!(entry.outcome, TaskOutcome::Cancelled);
        assert_eq!(entry.restarts, 1);
        assert!(entry.published >= 1);
        assert!(!sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_device_is_contained() {
        let devices = fleet(2);
        let mut connector = FakeConnector::default();
        let (_, exploded_sink) = connector.add("dog-1");
        let (healthy, _) = connector.add("dog-2");
        healthy.latch(topics::LOW_STATE, sample());
        connector.exploding.push("dog-1".to_string());
        let supervisor =
            StreamSupervisor::new(connector, StreamSettings::default()).with_policy(RestartPolicy::never());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let report = supervisor.run(&devices, cancel).await;

        match &report.get("dog-1").unwrap().outcome {
            TaskOutcome::Failed { error } => assert!(error.contains("driver blew up"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(report.get("dog-2").unwrap().outcome, TaskOutcome::Cancelled);
        assert_eq!(report.get("dog-2").unwrap().published, 3);
        assert!(exploded_sink.is_stopped());
        assert!(exploded_sink.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sink_still_releases_its_channel() {
        let devices = fleet(2);
        let mut connector = FakeConnector::default();
        let (channel, sink) = connector.add("dog-1");
        channel.latch(topics::LOW_STATE, sample());
        let (healthy, _) = connector.add("dog-2");
        healthy.latch(topics::LOW_STATE, sample());
        connector.panicking_sinks.push("dog-1".to_string());
        let supervisor =
            StreamSupervisor::new(connector, StreamSettings::default()).with_policy(RestartPolicy::never());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let report = supervisor.run(&devices, cancel).await;

        match &report.get("dog-1").unwrap().outcome {
            TaskOutcome::Failed { error } => assert!(error.contains("sink exploded"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(channel.connect_count(), 1);
        assert_eq!(channel.close_count(), 1);
        assert!(!channel.is_open());
        assert!(sink.is_stopped());
        assert!(sink.is_disconnected());
        assert_eq!(report.get("dog-2").unwrap().published, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_run_stops_every_device() {
        let devices = fleet(2);
        let mut connector = FakeConnector::default();
        let mut handles = Vec::new();
        for device in &devices {
            let (channel, sink) = connector.add(&device.id);
            channel.latch(topics::LOW_STATE, sample());
            handles.push((channel, sink));
        }
        let supervisor = StreamSupervisor::new(connector, StreamSettings::default());
        let cancel = CancellationToken::new();

        // Samples at t = 0 and 3, then the run is dropped at t = 4.
        let result = tokio::time::timeout(Duration::from_secs(4), supervisor.run(&devices, cancel.clone())).await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!cancel.is_cancelled());
        for (channel, sink) in &handles {
            assert_eq!(sink.len(), 2);
            assert_eq!(channel.close_count(), 1);
            assert!(!channel.is_open());
            assert!(sink.is_stopped());
            assert!(sink.is_disconnected());
        }
    }

    #[test]
    fn report_serializes_flat() {
        let report = FleetReport {
            devices: vec![DeviceReport {
                id: "dog-1".into(),
                outcome: TaskOutcome::Failed {
                    error: "refused".into(),
                },
                restarts: 3,
                published: 0,
                missed: 0,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["devices"][0]["outcome"], "failed");
        assert_eq!(json["devices"][0]["error"], "refused");
        assert!(!report.is_clean());
    }
}
