//! Coordinator side of the sync protocol
//!
//! The hub keeps no per-instance state: every envelope is answered on its own,
//! so envelopes from many instances may interleave freely.

use crate::handlers::MessageHandler;
use log::{debug, error, info, warn};
use shared::{Envelope, TransportChannel, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_NAME: &str = "report-sync-coordinator";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Token instances must present in AUTH
    pub secret: String,
    pub name: String,
    pub version: String,
}

impl HubConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            name: DEFAULT_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

pub struct CoordinatorSyncHub {
    config: HubConfig,
    handlers: HashMap<String, Box<dyn MessageHandler>>,
}

impl CoordinatorSyncHub {
    pub fn new(config: HubConfig) -> Self {
        if config.secret.trim().is_empty() {
            warn!("Coordinator secret is empty, every AUTH will be rejected");
        }
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Routes MESSAGE envelopes of `message_type` to `handler`
    pub fn with_handler(
        mut self,
        message_type: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.handlers.insert(message_type.into(), Box::new(handler));
        self
    }

    /// Decodes one payload and encodes the reply, if any
    ///
    /// Malformed payloads and unexpected kinds are logged and dropped.
    pub fn dispatch(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope ({} bytes): {}", bytes.len(), e);
                return None;
            }
        };

        let reply = self.handle(envelope)?;
        match reply.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode {}: {}", reply.kind(), e);
                None
            }
        }
    }

    pub fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Auth {
                token,
                plugin_version,
            } => {
                let valid = !self.config.secret.trim().is_empty() && token == self.config.secret;
                if valid {
                    info!("Instance authenticated (plugin version {})", plugin_version);
                } else {
                    warn!(
                        "Rejected AUTH with invalid token (plugin version {})",
                        plugin_version
                    );
                }
                Some(Envelope::AuthResponse {
                    valid,
                    coordinator_name: self.config.name.clone(),
                    coordinator_version: self.config.version.clone(),
                })
            }

            Envelope::Message {
                correlation_id,
                message_type,
                fields,
            } => {
                let success = self.route(correlation_id, &message_type, fields);
                Some(Envelope::MessageResponse {
                    correlation_id,
                    success,
                })
            }

            Envelope::Ping { timestamp } => {
                debug!("Ping received");
                Some(Envelope::PingResponse { timestamp })
            }

            other => {
                warn!("Unexpected {} envelope at coordinator", other.kind());
                None
            }
        }
    }

    fn route(&self, correlation_id: Uuid, message_type: &str, fields: Vec<(String, String)>) -> bool {
        let Some(handler) = self.handlers.get(message_type) else {
            warn!("Unknown message type: {}", message_type);
            return false;
        };

        let data: HashMap<String, String> = fields.into_iter().collect();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&data)));

        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Handler for {} failed: {}", message_type, e);
                false
            }
            Err(_) => {
                error!("Handler for {} panicked", message_type);
                false
            }
        };

        info!(
            "Processed {} message {} {}",
            message_type,
            correlation_id,
            if success { "successfully" } else { "with errors" }
        );
        success
    }

    /// Installs the hub as `channel`'s dispatch. Replies go back through the
    /// carrier each request arrived on.
    pub fn attach(self: &Arc<Self>, channel: &Arc<TransportChannel>) {
        let hub = Arc::clone(self);
        let weak_channel = Arc::downgrade(channel);

        channel.set_dispatch(move |payload, from| {
            let Some(reply) = hub.dispatch(payload) else {
                return;
            };
            if let Some(channel) = weak_channel.upgrade() {
                if !channel.send_via(from, &reply) {
                    warn!("Failed to reply to {}", from.id());
                }
            }
        });
    }
}
