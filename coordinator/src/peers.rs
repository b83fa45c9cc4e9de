//! Instance peers seen by the coordinator
//!
//! Any address that sends a frame becomes a peer and is usable as a carrier
//! for replies until it stays silent longer than the peer timeout.

use log::info;
use shared::transport::UdpCarrier;
use shared::Carrier;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Default silence after which a peer is dropped
pub const PEER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub carrier: Arc<dyn Carrier>,
    /// Last time we received any frame from this peer
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(addr: SocketAddr, carrier: Arc<dyn Carrier>) -> Self {
        Self {
            addr,
            carrier,
            last_seen: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct PeerManager {
    peers: HashMap<SocketAddr, Peer>,
    timeout: Duration,
}

impl PeerManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Records activity from `addr`, creating the peer on first contact.
    /// Returns the peer's carrier and whether it is new.
    pub fn touch(&mut self, addr: SocketAddr, socket: &Arc<UdpSocket>) -> (Arc<dyn Carrier>, bool) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_seen = Instant::now();
            return (Arc::clone(&peer.carrier), false);
        }

        let carrier: Arc<dyn Carrier> = Arc::new(UdpCarrier::new(Arc::clone(socket), addr));
        info!("Peer connected from {}", addr);
        self.peers
            .insert(addr, Peer::new(addr, Arc::clone(&carrier)));
        (carrier, true)
    }

    pub fn remove_peer(&mut self, addr: &SocketAddr) -> Option<Peer> {
        let peer = self.peers.remove(addr)?;
        info!("Peer {} disconnected", addr);
        Some(peer)
    }

    /// Removes and returns every peer idle past the timeout
    pub fn check_timeouts(&mut self) -> Vec<Peer> {
        let timeout = self.timeout;
        let timed_out: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.addr)
            .collect();

        timed_out
            .iter()
            .filter_map(|addr| self.remove_peer(addr))
            .collect()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
