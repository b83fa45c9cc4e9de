//! UDP carriers: each datagram holds one channel frame addressed to a peer

use super::{Carrier, TransportError};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Datagram framing: the channel name followed by the opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl ChannelFrame {
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Extracts the payload if the frame is addressed to `channel`
    pub fn open(bytes: &[u8], channel: &str) -> Option<Vec<u8>> {
        match Self::from_bytes(bytes) {
            Ok(frame) if frame.channel == channel => Some(frame.payload),
            _ => None,
        }
    }
}

/// Carrier relaying frames to one peer over a shared socket
pub struct UdpCarrier {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpCarrier {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl Carrier for UdpCarrier {
    fn id(&self) -> String {
        self.peer.to_string()
    }

    fn relay(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        let relay_error = |source: io::Error| TransportError::Relay {
            carrier: self.id(),
            source,
        };

        let bytes = ChannelFrame::new(channel, payload.to_vec())
            .to_bytes()
            .map_err(|e| relay_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // Non-blocking so relays can run from synchronous dispatch callbacks
        self.socket
            .try_send_to(&bytes, self.peer)
            .map_err(relay_error)?;
        Ok(())
    }
}
