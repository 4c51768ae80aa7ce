//! In-process transport
//!
//! A [`MemoryHub`] connects [`MemoryTransport`]s with tokio duplex pipes.
//! Peers only reach each other over explicit links, the dialer must have an
//! address for the peer in its address book, and each side's gate is
//! consulted the same way the swarm consults it.

use async_trait::async_trait;
use futures::channel::mpsc;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::transport::{BoxStream, IncomingStreams, Transport};
use crate::error::{FedError, Result};
use crate::gate::PeerGate;

const PIPE_CAPACITY: usize = 64 * 1024;

struct PeerSlot {
    address: Multiaddr,
    gate: Option<Arc<dyn PeerGate>>,
    listeners: HashMap<StreamProtocol, mpsc::UnboundedSender<(PeerId, BoxStream)>>,
}

#[derive(Default)]
struct HubState {
    next_port: u64,
    peers: HashMap<PeerId, PeerSlot>,
    links: HashSet<(PeerId, PeerId)>,
}

impl HubState {
    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&(*a, *b)) || self.links.contains(&(*b, *a))
    }
}

/// Shared switchboard for in-process peers
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer to the hub
    pub fn join(&self, peer: PeerId, gate: Option<Arc<dyn PeerGate>>) -> MemoryTransport {
        let mut state = self.state.lock();
        state.next_port += 1;
        let address = Multiaddr::empty().with(Protocol::Memory(state.next_port));
        state.peers.insert(
            peer,
            PeerSlot {
                address,
                gate,
                listeners: HashMap::new(),
            },
        );

        MemoryTransport {
            hub: self.clone(),
            peer,
            address_book: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allow `a` and `b` to open streams to each other
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().links.insert((*a, *b));
    }

    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        state.links.remove(&(*a, *b));
        state.links.remove(&(*b, *a));
    }

    /// Transport address of a joined peer
    pub fn address_of(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.state.lock().peers.get(peer).map(|slot| slot.address.clone())
    }
}

/// One peer's view of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    peer: PeerId,
    address_book: Arc<Mutex<HashMap<PeerId, Vec<Multiaddr>>>>,
}

impl MemoryTransport {
    fn denied(peer: &PeerId, reason: &str) -> FedError {
        FedError::StreamOpen {
            peer_id: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.hub.address_of(&self.peer).into_iter().collect()
    }

    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        let mut book = self.address_book.lock();
        let known = book.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<BoxStream> {
        let known = self
            .address_book
            .lock()
            .get(&peer)
            .cloned()
            .unwrap_or_default();

        let state = self.hub.state.lock();
        let local = state
            .peers
            .get(&self.peer)
            .ok_or_else(|| Self::denied(&self.peer, "local peer left the hub"))?;
        let remote = state
            .peers
            .get(&peer)
            .ok_or_else(|| Self::denied(&peer, "unknown peer"))?;

        if !known.contains(&remote.address) {
            return Err(FedError::DialError(format!("no known address for {}", peer)));
        }
        if !state.linked(&self.peer, &peer) {
            return Err(Self::denied(&peer, "unreachable"));
        }

        if let Some(gate) = &local.gate {
            if !gate.allow_dial_peer(&peer) || !gate.allow_dial_addr(&peer, &remote.address) {
                debug!("Refusing to dial {}", peer);
                return Err(Self::denied(&peer, "connection denied"));
            }
        }
        if let Some(gate) = &remote.gate {
            if !gate.allow_inbound(&remote.address, &local.address)
                || !gate.allow_secured(&self.peer)
            {
                debug!("{} rejected connection from {}", peer, self.peer);
                return Err(Self::denied(&peer, "connection denied"));
            }
        }

        let listener = remote
            .listeners
            .get(&protocol)
            .ok_or_else(|| Self::denied(&peer, "protocol not supported"))?;

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .unbounded_send((self.peer, Box::new(theirs) as BoxStream))
            .map_err(|_| Self::denied(&peer, "protocol not supported"))?;

        Ok(Box::new(ours))
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams> {
        let mut state = self.hub.state.lock();
        let slot = state
            .peers
            .get_mut(&self.peer)
            .ok_or_else(|| FedError::StreamError("peer left the hub".to_string()))?;

        if slot
            .listeners
            .get(&protocol)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(FedError::StreamError(format!(
                "protocol {} already accepted",
                protocol
            )));
        }

        let (tx, rx) = mpsc::unbounded();
        slot.listeners.insert(protocol, tx);
        Ok(Box::pin(rx))
    }
}
