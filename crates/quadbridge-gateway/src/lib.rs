//! `quadbridge-gateway` – The Command Surface
//!
//! A thin HTTP front for operators: stand the robot up or down, read its
//! sport-mode state once, and look at how the telemetry fleet is doing.
//!
//! - [`facade`] – [`CommandFacade`]: fire-and-forget commands and
//!   correlated status reads over one robot channel.
//! - [`server`] – [`GatewayServer`]: axum routes on port `8080` with
//!   graceful shutdown.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quadbridge_gateway::{CommandFacade, GatewayServer};
//! use quadbridge_middleware::WsTopicChannel;
//! use quadbridge_runtime::FleetStatus;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let channel = Arc::new(WsTopicChannel::new("ws://192.168.100.101:8081/channel"));
//!     let facade = Arc::new(CommandFacade::new(channel));
//!     GatewayServer::new(facade, FleetStatus::new())
//!         .run(CancellationToken::new())
//!         .await
//!         .expect("gateway failed");
//! }
//! ```

pub mod facade;
pub mod server;

pub use facade::{CommandFacade, StatusReply};
pub use server::{DEFAULT_PORT, GatewayServer, router};
