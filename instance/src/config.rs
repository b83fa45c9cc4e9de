//! Tunables for the instance-side sync agent

use crate::identity::SyncToken;
use std::time::Duration;

/// How long to wait for an AUTH_RESPONSE before retrying
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// AUTH envelopes sent per session before giving up
pub const MAX_AUTH_ATTEMPTS: u32 = 5;
/// How long a MESSAGE waits for its MESSAGE_RESPONSE
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Period of the connection health check
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Silence after which the health check probes the coordinator
pub const SYNC_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Delay between a carrier connecting and the triggered authentication
pub const CARRIER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Shared secret presented to the coordinator
    pub token: Option<SyncToken>,
    /// Version advertised in AUTH envelopes
    pub plugin_version: String,
    pub auth_timeout: Duration,
    pub max_auth_attempts: u32,
    pub message_timeout: Duration,
    pub health_interval: Duration,
    pub sync_threshold: Duration,
    pub carrier_grace: Duration,
}

impl AgentConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(SyncToken::new(token)),
            ..Self::default()
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: None,
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            auth_timeout: AUTH_TIMEOUT,
            max_auth_attempts: MAX_AUTH_ATTEMPTS,
            message_timeout: MESSAGE_TIMEOUT,
            health_interval: HEALTH_CHECK_INTERVAL,
            sync_threshold: SYNC_THRESHOLD,
            carrier_grace: CARRIER_GRACE,
        }
    }
}
