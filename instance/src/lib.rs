//! # Report Sync Instance Library
//!
//! Everything a game-server instance needs to take part in report sync:
//! the client sync agent, its identity in the shared report store, and the
//! UDP link to the coordinator.
//!
//! ## Module Organization
//!
//! ### Agent Module (`agent`)
//! Authentication handshake, correlated request/response messaging with
//! timeouts, and the periodic connection health check.
//!
//! ### Identity Module (`identity`)
//! The persistent instance token and reconciliation of (token, logical name)
//! against the shared store, including renames and re-registration.
//!
//! ### Network Module (`network`)
//! UDP socket, carrier and channel wiring toward one coordinator.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use instance::{AgentConfig, ClientSyncAgent, CoordinatorLink};
//! use shared::transport::Messenger;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut link = CoordinatorLink::connect("127.0.0.1:8080", Arc::new(Messenger::new())).await?;
//!     let agent = ClientSyncAgent::new(AgentConfig::new("secret"), link.channel());
//!     link.spawn_receiver();
//!     link.attach_carrier();
//!
//!     if agent.authenticate().await {
//!         let sent = agent
//!             .send_message("NEW_REPORT", [("id", "1"), ("reporter_name", "Steve")])
//!             .await;
//!         println!("delivered: {}", sent);
//!     }
//!
//!     agent.cleanup();
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod completion;
pub mod config;
pub mod identity;
pub mod network;

pub use agent::{AuthState, ClientSyncAgent};
pub use completion::Completion;
pub use config::AgentConfig;
pub use identity::{IdentityReconciler, ReconcileOutcome, SqliteIdentityStore, SyncToken};
pub use network::CoordinatorLink;
