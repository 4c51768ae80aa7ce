//! Swarm Management for Fedlink
//!
//! Owns the libp2p swarm and drives it from a spawned event loop. The rest
//! of the crate talks to it through a cloneable [`NetworkHandle`].

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identify, noise, ping, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, StreamProtocol,
    Swarm,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use super::behaviour::{FedBehaviour, FedBehaviourEvent};
use super::identity::PeerIdentity;
use super::transport::{BoxStream, IncomingStreams, Transport};
use crate::error::{FedError, Result};
use crate::gate::{GateBehaviour, PeerGate};

/// Idle connection timeout
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Events emitted by the peer network
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Listening on an address
    Listening { address: Multiaddr },
    /// Peer connected
    PeerConnected { peer_id: PeerId },
    /// Peer disconnected
    PeerDisconnected { peer_id: PeerId },
    /// Dial failed
    DialFailed { peer_id: PeerId, message: String },
}

/// Commands executed by the swarm event loop
#[derive(Debug)]
pub enum SwarmCommand {
    AddAddresses { peer: PeerId, addrs: Vec<Multiaddr> },
    Dial { peer: PeerId },
    Shutdown,
}

/// High-level peer network manager
pub struct PeerNetwork {
    identity: PeerIdentity,
    swarm: Swarm<FedBehaviour>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    command_tx: mpsc::Sender<SwarmCommand>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::Sender<NetworkEvent>,
    event_rx: Option<mpsc::Receiver<NetworkEvent>>,
}

impl PeerNetwork {
    /// Create a new peer network guarded by `gate`
    pub fn new(identity: PeerIdentity, gate: Arc<dyn PeerGate>) -> Result<Self> {
        let local_peer_id = *identity.peer_id();
        let keypair = identity.keypair().clone();

        info!("Local peer ID: {}", local_peer_id);

        let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| FedError::NetworkInitialization(e.to_string()))?
            .with_quic()
            .with_dns()
            .map_err(|e| FedError::NetworkInitialization(e.to_string()))?
            .with_behaviour(|key| {
                let identify = identify::Behaviour::new(
                    identify::Config::new("/fedlink/id/1.0.0".to_string(), key.public())
                        .with_agent_version(format!("fedlink/{}", env!("CARGO_PKG_VERSION"))),
                );

                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(10)),
                );

                FedBehaviour {
                    gate: GateBehaviour::new(gate),
                    identify,
                    ping,
                    stream: libp2p_stream::Behaviour::new(),
                }
            })
            .map_err(|e| FedError::NetworkInitialization(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_TIMEOUT))
            .build();

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        Ok(Self {
            identity,
            swarm,
            listen_addrs: Arc::new(RwLock::new(Vec::new())),
            command_tx,
            command_rx,
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Get our peer ID
    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Take the event receiver; `None` once taken
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<NetworkEvent>> {
        self.event_rx.take()
    }

    /// Listen on TCP and QUIC, IPv4 and IPv6, at `port` (0 = random)
    pub fn start_listening(&mut self, port: u16) -> Result<()> {
        let tcp_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", port).parse()?;
        let quic_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", port).parse()?;

        self.swarm.listen_on(tcp_addr)?;
        self.swarm.listen_on(quic_addr)?;

        // IPv6 is best effort
        for raw in [
            format!("/ip6/::/tcp/{}", port),
            format!("/ip6/::/udp/{}/quic-v1", port),
        ] {
            if let Ok(addr) = raw.parse::<Multiaddr>() {
                if let Err(e) = self.swarm.listen_on(addr) {
                    debug!("IPv6 listener unavailable: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Cloneable handle used by the rest of the overlay
    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            local_peer_id: *self.identity.peer_id(),
            control: self.swarm.behaviour().stream.new_control(),
            command_tx: self.command_tx.clone(),
            listen_addrs: Arc::clone(&self.listen_addrs),
        }
    }

    /// Run the event loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the swarm until a shutdown command arrives
    pub async fn run(mut self) {
        info!("Starting Fedlink network...");

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(SwarmCommand::AddAddresses { peer, addrs }) => {
                            for addr in addrs {
                                self.swarm.add_peer_address(peer, addr);
                            }
                        }
                        Some(SwarmCommand::Dial { peer }) => {
                            if let Err(e) = self.swarm.dial(peer) {
                                warn!("Failed to dial {}: {}", peer, e);
                            }
                        }
                        Some(SwarmCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        info!("Fedlink network stopped");
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<FedBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.write().push(address.clone());
                let _ = self.event_tx.try_send(NetworkEvent::Listening { address });
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.write().retain(|a| a != &address);
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!("Connected to peer: {}", peer_id);
                let _ = self.event_tx.try_send(NetworkEvent::PeerConnected { peer_id });
            }

            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                info!("Disconnected from peer: {}", peer_id);
                let _ = self
                    .event_tx
                    .try_send(NetworkEvent::PeerDisconnected { peer_id });
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!("Failed to connect to {}: {}", peer_id, error);
                let _ = self.event_tx.try_send(NetworkEvent::DialFailed {
                    peer_id,
                    message: error.to_string(),
                });
            }

            SwarmEvent::IncomingConnectionError { error, .. } => {
                debug!("Inbound connection failed: {}", error);
            }

            SwarmEvent::Behaviour(FedBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!("Identified peer {}: {}", peer_id, info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(FedBehaviourEvent::Ping(ping::Event {
                peer,
                result: Err(e),
                ..
            })) => {
                debug!("Ping to {} failed: {}", peer, e);
            }

            _ => {}
        }
    }
}

/// Cloneable access to a running [`PeerNetwork`]
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    control: libp2p_stream::Control,
    command_tx: mpsc::Sender<SwarmCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

impl NetworkHandle {
    /// Ask the swarm to connect to `peer` using its known addresses
    pub async fn dial(&self, peer: PeerId) -> Result<()> {
        self.send(SwarmCommand::Dial { peer }).await
    }

    /// Stop the swarm event loop
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SwarmCommand::Shutdown).await
    }

    async fn send(&self, command: SwarmCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| FedError::NetworkInitialization("swarm event loop stopped".to_string()))
    }
}

#[async_trait]
impl Transport for NetworkHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().clone()
    }

    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        self.send(SwarmCommand::AddAddresses { peer, addrs }).await
    }

    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<BoxStream> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, protocol)
            .await
            .map_err(|e| FedError::StreamOpen {
                peer_id: peer.to_string(),
                reason: e.to_string(),
            })?;

        // Convert futures AsyncRead/Write to tokio AsyncRead/Write
        Ok(Box::new(stream.compat()))
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams> {
        let incoming = self
            .control
            .clone()
            .accept(protocol)
            .map_err(|e| FedError::StreamError(e.to_string()))?;

        Ok(Box::pin(incoming.map(|(peer, stream)| {
            (peer, Box::new(stream.compat()) as BoxStream)
        })))
    }
}
