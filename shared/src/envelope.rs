//! Envelopes exchanged between game-server instances and the coordinator
//!
//! One envelope travels per carrier payload. The first field is always the
//! kind tag; the remaining fields follow in the fixed order listed for each
//! variant. Trailing fields that older peers omit decode to defaults.

use crate::wire::{CodecError, WireReader, WireWriter};
use uuid::Uuid;

/// Fallback used when a peer omits an informational trailing string
pub const UNKNOWN: &str = "unknown";

const MAX_FIELDS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    // Instance -> coordinator
    Auth {
        token: String,
        plugin_version: String,
    },
    Message {
        correlation_id: Uuid,
        message_type: String,
        fields: Vec<(String, String)>,
    },
    Ping {
        timestamp: i64,
    },

    // Coordinator -> instance
    AuthResponse {
        valid: bool,
        coordinator_name: String,
        coordinator_version: String,
    },
    MessageResponse {
        correlation_id: Uuid,
        success: bool,
    },
    PingResponse {
        timestamp: i64,
    },
}

impl Envelope {
    pub const AUTH: &'static str = "AUTH";
    pub const AUTH_RESPONSE: &'static str = "AUTH_RESPONSE";
    pub const MESSAGE: &'static str = "MESSAGE";
    pub const MESSAGE_RESPONSE: &'static str = "MESSAGE_RESPONSE";
    pub const PING: &'static str = "PING";
    pub const PING_RESPONSE: &'static str = "PING_RESPONSE";

    /// Wire tag of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Auth { .. } => Self::AUTH,
            Envelope::AuthResponse { .. } => Self::AUTH_RESPONSE,
            Envelope::Message { .. } => Self::MESSAGE,
            Envelope::MessageResponse { .. } => Self::MESSAGE_RESPONSE,
            Envelope::Ping { .. } => Self::PING,
            Envelope::PingResponse { .. } => Self::PING_RESPONSE,
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Envelope::Message { correlation_id, .. }
            | Envelope::MessageResponse { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    /// Serializes the envelope into one carrier payload
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = WireWriter::new();
        out.write_string("kind", self.kind())?;

        match self {
            Envelope::Auth {
                token,
                plugin_version,
            } => {
                out.write_string("token", token)?;
                out.write_string("plugin_version", plugin_version)?;
            }
            Envelope::AuthResponse {
                valid,
                coordinator_name,
                coordinator_version,
            } => {
                out.write_bool("valid", *valid)?;
                out.write_string("coordinator_name", coordinator_name)?;
                out.write_string("coordinator_version", coordinator_version)?;
            }
            Envelope::Message {
                correlation_id,
                message_type,
                fields,
            } => {
                if fields.len() > MAX_FIELDS {
                    return Err(CodecError::TooManyFields(fields.len()));
                }
                out.write_string("correlation_id", &correlation_id.to_string())?;
                out.write_string("message_type", message_type)?;
                out.write_i32("field_count", fields.len() as i32)?;
                for (key, value) in fields {
                    out.write_string("field_key", key)?;
                    out.write_string("field_value", value)?;
                }
            }
            Envelope::MessageResponse {
                correlation_id,
                success,
            } => {
                out.write_string("correlation_id", &correlation_id.to_string())?;
                out.write_bool("success", *success)?;
            }
            Envelope::Ping { timestamp } | Envelope::PingResponse { timestamp } => {
                out.write_i64("timestamp", *timestamp)?;
            }
        }

        out.finish()
    }

    /// Parses one carrier payload
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut input = WireReader::new(bytes);
        let kind = input.read_string("kind")?;

        let envelope = match kind.as_str() {
            Self::AUTH => Envelope::Auth {
                token: input.read_string("token")?,
                plugin_version: input.read_string_or("plugin_version", UNKNOWN)?,
            },
            Self::AUTH_RESPONSE => Envelope::AuthResponse {
                valid: input.read_bool("valid")?,
                coordinator_name: input.read_string_or("coordinator_name", UNKNOWN)?,
                coordinator_version: input.read_string_or("coordinator_version", UNKNOWN)?,
            },
            Self::MESSAGE => {
                let correlation_id = read_correlation_id(&mut input)?;
                let message_type = input.read_string("message_type")?;
                let count = input.read_i32("field_count")?;
                if count < 0 {
                    return Err(CodecError::NegativeFieldCount(count));
                }
                let count = count as usize;
                if count > MAX_FIELDS {
                    return Err(CodecError::TooManyFields(count));
                }

                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = input.read_string("field_key")?;
                    let value = input.read_string("field_value")?;
                    fields.push((key, value));
                }

                Envelope::Message {
                    correlation_id,
                    message_type,
                    fields,
                }
            }
            Self::MESSAGE_RESPONSE => Envelope::MessageResponse {
                correlation_id: read_correlation_id(&mut input)?,
                success: input.read_bool("success")?,
            },
            Self::PING => Envelope::Ping {
                timestamp: if input.is_empty() {
                    0
                } else {
                    input.read_i64("timestamp")?
                },
            },
            Self::PING_RESPONSE => Envelope::PingResponse {
                timestamp: input.read_i64("timestamp")?,
            },
            _ => return Err(CodecError::UnknownKind(kind)),
        };

        Ok(envelope)
    }
}

fn read_correlation_id(input: &mut WireReader<'_>) -> Result<Uuid, CodecError> {
    let raw = input.read_string("correlation_id")?;
    Uuid::parse_str(&raw).map_err(|_| CodecError::InvalidCorrelationId(raw))
}
