//! Self-describing node addresses
//!
//! A node address is a multiaddr that ends in `/p2p/<peer-id>`. The transport
//! part is what gets dialed, the trailing component names the node.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use std::str::FromStr;

use crate::error::{FedError, Result};

/// A parsed `<transport-locator>/p2p/<peer-identity>` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    peer_id: PeerId,
    transport: Multiaddr,
}

impl NodeAddress {
    /// Parse a self-describing address string
    pub fn parse(raw: &str) -> Result<Self> {
        let addr: Multiaddr = raw
            .parse()
            .map_err(|e| FedError::InvalidAddress(format!("{}: {}", raw, e)))?;
        Self::from_multiaddr(addr)
    }

    /// Split a full multiaddr into its transport part and peer identity
    pub fn from_multiaddr(addr: Multiaddr) -> Result<Self> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(peer_id)) => Ok(Self { peer_id, transport }),
            _ => Err(FedError::InvalidAddress(format!(
                "{} does not end in /p2p/<peer-id>",
                addr
            ))),
        }
    }

    /// Build the address peers use to reach `peer_id` at `listen`
    pub fn connect_address(listen: &Multiaddr, peer_id: &PeerId) -> Self {
        let mut transport = listen.clone();
        if let Some(Protocol::P2p(_)) = transport.iter().last() {
            transport.pop();
        }
        Self {
            peer_id: *peer_id,
            transport,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The dialable part, without the trailing `/p2p/` component
    pub fn transport(&self) -> &Multiaddr {
        &self.transport
    }

    /// The full address including the peer identity
    pub fn to_multiaddr(&self) -> Multiaddr {
        self.transport.clone().with(Protocol::P2p(self.peer_id))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_multiaddr())
    }
}

impl FromStr for NodeAddress {
    type Err = FedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Decode a stored peer identity string
pub fn parse_peer_id(raw: &str) -> Result<PeerId> {
    raw.parse()
        .map_err(|e| FedError::InvalidPeerId(format!("{}: {}", raw, e)))
}

/// Parse every address of a node, requiring them to agree on one identity
pub fn parse_node_addresses<S: AsRef<str>>(raw: &[S]) -> Result<(PeerId, Vec<NodeAddress>)> {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut peer: Option<PeerId> = None;

    for address in raw {
        let address = NodeAddress::parse(address.as_ref())?;
        match peer {
            Some(existing) if existing != *address.peer_id() => {
                return Err(FedError::InvalidAddress(
                    "addresses name more than one peer identity".to_string(),
                ));
            }
            _ => peer = Some(*address.peer_id()),
        }
        parsed.push(address);
    }

    let peer = peer.ok_or_else(|| FedError::InvalidAddress("no addresses given".to_string()))?;
    Ok((peer, parsed))
}
