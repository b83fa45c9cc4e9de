//! # Report Sync Coordinator Library
//!
//! The central process game-server instances authenticate against. It checks
//! instance tokens, routes typed messages to business handlers and answers
//! liveness probes, replying through whichever peer delivered each request.
//!
//! ## Module Organization
//!
//! ### Hub Module (`hub`)
//! Stateless envelope handling: AUTH validation, MESSAGE routing with
//! handler faults contained, PING echo.
//!
//! ### Handlers Module (`handlers`)
//! Business handlers keyed by message type. `NEW_REPORT` is parsed into a
//! `ReportNotice` and announced through a `NotificationSink`.
//!
//! ### Peers Module (`peers`)
//! Instance peers tracked by address, with idle timeout.
//!
//! ### Network Module (`network`)
//! The UDP relay loop tying sockets, peers and the hub together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coordinator::handlers::{LogSink, ReportBroadcaster, NEW_REPORT};
//! use coordinator::hub::{CoordinatorSyncHub, HubConfig};
//! use coordinator::network::RelayServer;
//! use shared::transport::Messenger;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = CoordinatorSyncHub::new(HubConfig::new("secret"))
//!         .with_handler(NEW_REPORT, ReportBroadcaster::new(LogSink));
//!
//!     let mut server = RelayServer::bind(
//!         "127.0.0.1:8080",
//!         Arc::new(hub),
//!         Arc::new(Messenger::new()),
//!         Duration::from_secs(60),
//!     )
//!     .await?;
//!
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod handlers;
pub mod hub;
pub mod network;
pub mod peers;

pub use hub::{CoordinatorSyncHub, HubConfig};
pub use network::RelayServer;
