//! Command/Status Facade over a single robot channel.
//!
//! Commands are fire-and-forget: one request is published and nothing waits
//! for the robot to act on it.  Status reads are one correlated wait; a
//! timeout is an ordinary [`StatusReply`], not an error.

use std::sync::Arc;
use std::time::Duration;

use quadbridge_middleware::{TopicChannel, await_topic};
use quadbridge_types::{BridgeError, Message, SportCommand};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Outcome of [`CommandFacade::read_status`].
///
/// Serialises as `{"status":"ok","data":..}` or
/// `{"status":"timeout","message":..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReply {
    Ok { data: Message },
    Timeout { message: String },
}

impl StatusReply {
    pub fn timed_out(timeout: Duration) -> Self {
        StatusReply::Timeout {
            message: format!("No message received within {} seconds", timeout.as_secs_f64()),
        }
    }
}

pub struct CommandFacade {
    channel: Arc<dyn TopicChannel>,
    // Serialises lazy connects from concurrent requests.
    connecting: Mutex<()>,
}

impl CommandFacade {
    pub fn new(channel: Arc<dyn TopicChannel>) -> Self {
        Self {
            channel,
            connecting: Mutex::new(()),
        }
    }

    /// Connect if the channel is not open yet.
    pub async fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.channel.is_open() {
            return Ok(());
        }
        let _guard = self.connecting.lock().await;
        if self.channel.is_open() {
            return Ok(());
        }
        debug!("connecting command channel");
        self.channel.connect().await
    }

    /// Publish `command` on `topic` and return without confirmation.
    pub async fn send_command(&self, topic: &str, command: SportCommand) -> Result<(), BridgeError> {
        self.ensure_connected().await?;
        self.channel.publish_request(topic, command.payload()).await?;
        info!(%command, api_id = command.api_id(), topic, "command sent");
        Ok(())
    }

    /// Wait up to `timeout` for the next message on `topic`.
    ///
    /// Only a failed connect is an error.
    pub async fn read_status(&self, topic: &str, timeout: Duration) -> Result<StatusReply, BridgeError> {
        self.ensure_connected().await?;
        match await_topic(self.channel.as_ref(), topic, timeout).await {
            Ok(data) => Ok(StatusReply::Ok { data }),
            Err(e) => {
                debug!(topic, error = %e, "no status within deadline");
                Ok(StatusReply::timed_out(timeout))
            }
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}
