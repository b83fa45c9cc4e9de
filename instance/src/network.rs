//! UDP link from an instance to its coordinator

use log::{debug, error, info};
use shared::transport::{ChannelFrame, ChannelRegistrar, UdpCarrier};
use shared::{Carrier, CarrierSet, CarrierSource, TransportChannel, CHANNEL};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Owner recorded when the instance claims the sync channel
pub const CHANNEL_OWNER: &str = "instance";

/// Socket, carrier and channel for one coordinator
pub struct CoordinatorLink {
    socket: Arc<UdpSocket>,
    coordinator: SocketAddr,
    carrier: Arc<dyn Carrier>,
    carriers: Arc<CarrierSet>,
    channel: Arc<TransportChannel>,
    receiver: Option<JoinHandle<()>>,
}

impl CoordinatorLink {
    pub async fn connect(
        coordinator: &str,
        registrar: Arc<dyn ChannelRegistrar>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let coordinator: SocketAddr = coordinator.parse()?;
        info!(
            "Linking {} to coordinator at {}",
            socket.local_addr()?,
            coordinator
        );

        let carrier: Arc<dyn Carrier> = Arc::new(UdpCarrier::new(Arc::clone(&socket), coordinator));
        let carriers = Arc::new(CarrierSet::new());
        let source: Arc<dyn CarrierSource> = Arc::clone(&carriers) as Arc<dyn CarrierSource>;
        let channel = Arc::new(TransportChannel::new(CHANNEL, CHANNEL_OWNER, registrar, source));

        Ok(Self {
            socket,
            coordinator,
            carrier,
            carriers,
            channel,
            receiver: None,
        })
    }

    pub fn channel(&self) -> Arc<TransportChannel> {
        Arc::clone(&self.channel)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Makes the coordinator reachable. Returns true on the transition from
    /// no carrier to one.
    pub fn attach_carrier(&self) -> bool {
        self.carriers.join(Arc::clone(&self.carrier))
    }

    pub fn detach_carrier(&self) {
        self.carriers.quit(&self.carrier.id());
    }

    /// Spawns task that feeds coordinator datagrams into the channel
    pub fn spawn_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let channel = Arc::clone(&self.channel);
        let carrier = Arc::clone(&self.carrier);
        let coordinator = self.coordinator;

        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; 64 * 1024];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) if addr == coordinator => {
                        match ChannelFrame::open(&buffer[..len], channel.name()) {
                            Some(payload) => channel.on_receive(&payload, &carrier),
                            None => debug!("Ignoring foreign frame from {}", addr),
                        }
                    }
                    Ok((_, addr)) => debug!("Ignoring datagram from unknown peer {}", addr),
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        if let Some(previous) = self.receiver.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for CoordinatorLink {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}
