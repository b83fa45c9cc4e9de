//! Coordinator network layer relaying sync frames over UDP

use crate::hub::CoordinatorSyncHub;
use crate::peers::PeerManager;
use log::{debug, error, info};
use shared::transport::{ChannelFrame, ChannelRegistrar};
use shared::{CarrierSet, CarrierSource, TransportChannel, CHANNEL};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owner recorded when the coordinator claims the sync channel
pub const CHANNEL_OWNER: &str = "coordinator";

/// Messages sent from network tasks to the relay loop
#[derive(Debug)]
pub enum ServerEvent {
    FrameReceived { bytes: Vec<u8>, addr: SocketAddr },
    PeerTimeout { addr: SocketAddr },
}

/// UDP front end feeding instance frames to the hub
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    channel: Arc<TransportChannel>,
    carriers: Arc<CarrierSet>,
    peers: Arc<Mutex<PeerManager>>,

    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayServer {
    pub async fn bind(
        addr: &str,
        hub: Arc<CoordinatorSyncHub>,
        registrar: Arc<dyn ChannelRegistrar>,
        peer_timeout: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Coordinator listening on {}", socket.local_addr()?);

        let carriers = Arc::new(CarrierSet::new());
        let source: Arc<dyn CarrierSource> = Arc::clone(&carriers) as Arc<dyn CarrierSource>;
        let channel = Arc::new(TransportChannel::new(CHANNEL, CHANNEL_OWNER, registrar, source));
        channel.register_channel()?;
        hub.attach(&channel);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket,
            channel,
            carriers,
            peers: Arc::new(Mutex::new(PeerManager::new(peer_timeout))),
            event_tx,
            event_rx,
            tasks: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.lock_peers().len()
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, PeerManager> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns task that continuously listens for incoming frames
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; 64 * 1024];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let event = ServerEvent::FrameReceived {
                            bytes: buffer[..len].to_vec(),
                            addr,
                        };
                        if let Err(e) = event_tx.send(event) {
                            error!("Failed to send frame to relay loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving frame: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Spawns task that monitors peer timeouts
    fn spawn_timeout_checker(&mut self) {
        let peers = Arc::clone(&self.peers);
        let event_tx = self.event_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .check_timeouts();

                for peer in timed_out {
                    if let Err(e) = event_tx.send(ServerEvent::PeerTimeout { addr: peer.addr }) {
                        error!("Failed to send timeout event: {}", e);
                        return;
                    }
                }
            }
        }));
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::FrameReceived { bytes, addr } => {
                let Some(payload) = ChannelFrame::open(&bytes, self.channel.name()) else {
                    debug!("Ignoring {} bytes from {} on another channel", bytes.len(), addr);
                    return;
                };

                let (carrier, created) = self.lock_peers().touch(addr, &self.socket);
                if created {
                    self.carriers.join(Arc::clone(&carrier));
                }
                self.channel.on_receive(&payload, &carrier);
            }

            ServerEvent::PeerTimeout { addr } => {
                // A frame queued ahead of this event may have re-created the peer
                if self.lock_peers().contains(&addr) {
                    debug!("Peer {} came back before its timeout was handled", addr);
                    return;
                }
                info!("Peer {} timed out", addr);
                self.carriers.quit(&addr.to_string());
            }
        }
    }

    /// Main relay loop, processing frames and peer timeouts in arrival order
    pub async fn run(&mut self) {
        self.spawn_network_receiver();
        self.spawn_timeout_checker();

        info!("Coordinator started successfully");

        while let Some(event) = self.event_rx.recv().await {
            self.handle_event(event);
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.channel.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use shared::transport::Messenger;
    use shared::Envelope;

    async fn server(peer_timeout: Duration) -> RelayServer {
        let hub = Arc::new(CoordinatorSyncHub::new(HubConfig::new("secret")));
        RelayServer::bind(
            "127.0.0.1:0",
            hub,
            Arc::new(Messenger::new()),
            peer_timeout,
        )
        .await
        .unwrap()
    }

    async fn exchange(client: &UdpSocket, server: SocketAddr, envelope: Envelope) -> Envelope {
        let frame = ChannelFrame::new(CHANNEL, envelope.encode().unwrap())
            .to_bytes()
            .unwrap();
        client.send_to(&frame, server).await.unwrap();

        let mut buffer = vec![0u8; 64 * 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server);

        let payload = ChannelFrame::open(&buffer[..len], CHANNEL).unwrap();
        Envelope::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_replies_to_sender() {
        let mut server = server(Duration::from_secs(60)).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = exchange(
            &client,
            addr,
            Envelope::Auth {
                token: "secret".to_string(),
                plugin_version: "1.0".to_string(),
            },
        )
        .await;

        assert!(matches!(reply, Envelope::AuthResponse { valid: true, .. }));
    }

    #[tokio::test]
    async fn test_peers_get_independent_replies() {
        let mut server = server(Duration::from_secs(60)).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let a = exchange(&first, addr, Envelope::Ping { timestamp: 1 }).await;
        let b = exchange(&second, addr, Envelope::Ping { timestamp: 2 }).await;

        assert_eq!(a, Envelope::PingResponse { timestamp: 1 });
        assert_eq!(b, Envelope::PingResponse { timestamp: 2 });
    }

    #[tokio::test]
    async fn test_tracks_and_expires_peers() {
        let mut server = server(Duration::from_millis(200)).await;
        let addr = server.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = socket.local_addr().unwrap();

        server.handle_event(ServerEvent::FrameReceived {
            bytes: ChannelFrame::new(CHANNEL, Envelope::Ping { timestamp: 3 }.encode().unwrap())
                .to_bytes()
                .unwrap(),
            addr: peer,
        });
        assert_eq!(server.peer_count(), 1);
        assert!(server.channel.has_carrier());

        let mut buffer = vec![0u8; 1024];
        let (_, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, addr);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let expired = server.lock_peers().check_timeouts();
        for peer in expired {
            server.handle_event(ServerEvent::PeerTimeout { addr: peer.addr });
        }
        assert_eq!(server.peer_count(), 0);
        assert!(!server.channel.has_carrier());
    }

    #[tokio::test]
    async fn test_stale_timeout_keeps_returning_peer() {
        let server = server(Duration::from_secs(60)).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = socket.local_addr().unwrap();
        let ping = || ServerEvent::FrameReceived {
            bytes: ChannelFrame::new(CHANNEL, Envelope::Ping { timestamp: 1 }.encode().unwrap())
                .to_bytes()
                .unwrap(),
            addr: peer,
        };

        server.handle_event(ping());
        // Expired by the checker, then heard from again before the event is handled
        assert!(server.lock_peers().remove_peer(&peer).is_some());
        server.handle_event(ping());

        server.handle_event(ServerEvent::PeerTimeout { addr: peer });
        assert_eq!(server.peer_count(), 1);
        assert!(server.channel.has_carrier());
        assert_eq!(server.carriers.len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_other_channels() {
        let server = server(Duration::from_secs(60)).await;

        server.handle_event(ServerEvent::FrameReceived {
            bytes: ChannelFrame::new("other:channel", vec![1, 2, 3])
                .to_bytes()
                .unwrap(),
            addr: "127.0.0.1:40000".parse().unwrap(),
        });
        server.handle_event(ServerEvent::FrameReceived {
            bytes: vec![0xde, 0xad],
            addr: "127.0.0.1:40001".parse().unwrap(),
        });

        assert_eq!(server.peer_count(), 0);
    }
}
