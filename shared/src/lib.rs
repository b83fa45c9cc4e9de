//! # Report Sync Shared Library
//!
//! Protocol pieces used by both game-server instances and the coordinator.
//!
//! ## Modules
//!
//! ### Envelope Module (`envelope`)
//! The six envelope kinds exchanged on the sync channel and their codec.
//!
//! ### Wire Module (`wire`)
//! Field-level primitives in `DataOutput` layout: u16-prefixed strings and
//! big-endian fixed-width integers.
//!
//! ### Transport Module (`transport`)
//! The named side-channel, carrier abstraction and UDP carriers.

pub mod envelope;
pub mod transport;
pub mod wire;

pub use envelope::Envelope;
pub use transport::{Carrier, CarrierSet, CarrierSource, TransportChannel, TransportError};
pub use wire::CodecError;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Name of the side-channel carrying sync traffic
pub const CHANNEL: &str = "aevorinreports:sync";

/// Token value shipped in default configurations; never valid for auth
pub const PLACEHOLDER_TOKEN: &str = "your_token_here";

/// Version string advertised in handshakes
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in milliseconds
pub fn get_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}
