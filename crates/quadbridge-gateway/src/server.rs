//! [`GatewayServer`] – HTTP surface of the command facade.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`GatewayServer::with_port`]).
//!
//! | Route | Response |
//! |---|---|
//! | `POST /stand_up` | `200`, empty body, once the request is published |
//! | `POST /stand_down` | same |
//! | `POST /status` | `{"status":"ok","data":..}` or `{"status":"timeout","message":..}` |
//! | `GET /fleet` | per-device stream status |
//!
//! When the robot channel cannot be opened every robot route answers
//! `502 {"status":"error","message":..}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use quadbridge_middleware::DEFAULT_WAIT;
use quadbridge_runtime::FleetStatus;
use quadbridge_types::{BridgeError, SportCommand, topics};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::facade::CommandFacade;

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone)]
struct AppState {
    facade: Arc<CommandFacade>,
    fleet: FleetStatus,
    status_timeout: Duration,
}

/// Build the gateway routes.
pub fn router(facade: Arc<CommandFacade>, fleet: FleetStatus, status_timeout: Duration) -> Router {
    let state = AppState {
        facade,
        fleet,
        status_timeout,
    };
    Router::new()
        .route("/stand_up", post(handle_stand_up))
        .route("/stand_down", post(handle_stand_down))
        .route("/status", post(handle_status))
        .route("/fleet", get(handle_fleet))
        .with_state(state)
}

pub struct GatewayServer {
    facade: Arc<CommandFacade>,
    fleet: FleetStatus,
    port: u16,
    status_timeout: Duration,
}

impl GatewayServer {
    /// Create a server on the [`DEFAULT_PORT`] with a 5 second status wait.
    pub fn new(facade: Arc<CommandFacade>, fleet: FleetStatus) -> Self {
        Self {
            facade,
            fleet,
            port: DEFAULT_PORT,
            status_timeout: DEFAULT_WAIT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override how long `/status` waits for the robot (builder-style).
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` fires.  The robot channel is closed on the
    /// way out.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the port cannot be bound and
    /// [`BridgeError::ConnectionFailure`] if serving fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Config(format!("bind gateway on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), BridgeError> {
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, "gateway listening");
        }
        let app = router(Arc::clone(&self.facade), self.fleet.clone(), self.status_timeout);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| BridgeError::ConnectionFailure(format!("gateway serve: {e}")));
        self.facade.close().await;
        info!("gateway stopped");
        served
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_stand_up(State(state): State<AppState>) -> Response {
    command(&state, SportCommand::StandUp).await
}

async fn handle_stand_down(State(state): State<AppState>) -> Response {
    command(&state, SportCommand::StandDown).await
}

async fn command(state: &AppState, command: SportCommand) -> Response {
    match state.facade.send_command(topics::SPORT_REQUEST, command).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => bad_gateway(e),
    }
}

async fn handle_status(State(state): State<AppState>) -> Response {
    match state
        .facade
        .read_status(topics::SPORT_MODE_STATE, state.status_timeout)
        .await
    {
        Ok(reply) => axum::Json(reply).into_response(),
        Err(e) => bad_gateway(e),
    }
}

async fn handle_fleet(State(state): State<AppState>) -> Response {
    axum::Json(state.fleet.snapshot()).into_response()
}

fn bad_gateway(error: BridgeError) -> Response {
    warn!(error = %error, "robot channel unavailable");
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(json!({ "status": "error", "message": error.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use quadbridge_middleware::{LoopbackChannel, TopicChannel};
    use quadbridge_types::{DeviceDescriptor, SecretToken, TelemetryKind};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(channel: &LoopbackChannel, fleet: FleetStatus) -> Router {
        let facade = Arc::new(CommandFacade::new(Arc::new(channel.clone())));
        router(facade, fleet, DEFAULT_WAIT)
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[test]
    fn default_port_is_8080() {
        let facade = Arc::new(CommandFacade::new(Arc::new(LoopbackChannel::new())));
        let server = GatewayServer::new(facade, FleetStatus::new());
        assert_eq!(server.port(), 8080);
        assert_eq!(server.with_port(9090).port(), 9090);
    }

    #[tokio::test]
    async fn stand_up_publishes_and_returns_empty_ok() {
        let channel = LoopbackChannel::new();
        let (status, body) = call(app(&channel, FleetStatus::new()), Method::POST, "/stand_up").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            channel.published(),
            vec![(topics::SPORT_REQUEST.to_string(), json!({ "api_id": 1004 }))]
        );
    }

    #[tokio::test]
    async fn stand_down_sends_1005() {
        let channel = LoopbackChannel::new();
        let (status, _) = call(app(&channel, FleetStatus::new()), Method::POST, "/stand_down").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(channel.published()[0].1, json!({ "api_id": 1005 }));
    }

    #[tokio::test]
    async fn unreachable_robot_is_bad_gateway() {
        let channel = LoopbackChannel::new();
        channel.refuse_connections(true);
        let app = app(&channel, FleetStatus::new());

        for uri in ["/stand_up", "/stand_down", "/status"] {
            let (status, body) = call(app.clone(), Method::POST, uri).await;
            assert_eq!(status, StatusCode::BAD_GATEWAY, "{uri}");
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().contains("refused"));
        }
    }

    #[tokio::test]
    async fn status_returns_sport_mode_state() {
        let channel = LoopbackChannel::new();
        channel.latch(topics::SPORT_MODE_STATE, json!({ "mode": 1, "gait_type": 0 }));
        let (status, body) = call(app(&channel, FleetStatus::new()), Method::POST, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "status": "ok", "data": { "mode": 1, "gait_type": 0 } }));
        assert_eq!(channel.subscriber_count(topics::SPORT_MODE_STATE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_robot_times_out_with_ok_status_code() {
        let channel = LoopbackChannel::new();
        let (status, body) = call(app(&channel, FleetStatus::new()), Method::POST, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({ "status": "timeout", "message": "No message received within 5 seconds" })
        );
    }

    #[tokio::test]
    async fn fleet_lists_devices() {
        let fleet = FleetStatus::new();
        fleet.register(&DeviceDescriptor::new(
            "dog-1",
            "192.168.100.101",
            SecretToken::new("t"),
            TelemetryKind::BmsState,
        ));
        let (status, body) = call(app(&LoopbackChannel::new(), fleet), Method::GET, "/fleet").await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body[0]["id"], "dog-1");
        assert_eq!(body[0]["kind"], "bms_state");
        assert_eq!(body[0]["state"], "disconnected");
    }

    #[tokio::test]
    async fn commands_require_post() {
        let channel = LoopbackChannel::new();
        let (status, _) = call(app(&channel, FleetStatus::new()), Method::GET, "/stand_up").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_and_closes_channel() {
        let channel = LoopbackChannel::new();
        let facade = Arc::new(CommandFacade::new(Arc::new(channel.clone())));
        facade.ensure_connected().await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(
            GatewayServer::new(facade, FleetStatus::new()).serve(listener, shutdown.clone()),
        );

        shutdown.cancel();
        server.await.unwrap().unwrap();
        assert!(!channel.is_open());
        assert_eq!(channel.close_count(), 1);
    }
}
