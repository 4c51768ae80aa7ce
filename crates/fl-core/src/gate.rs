//! Connection Gate
//!
//! Decides which peers may hold a connection with this node. The transport
//! consults the gate at four points of a connection's life:
//! - a raw inbound connection is accepted
//! - an address is dialed
//! - a peer is dialed
//! - a secure channel has been established
//!
//! Peer identity is unknown while a raw inbound connection is being
//! accepted, so that hook always allows. The established-inbound hook is
//! where unknown callers are turned away.

use libp2p::core::transport::PortUse;
use libp2p::core::Endpoint;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
    THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

use crate::address::{parse_node_addresses, parse_peer_id};
use crate::error::Result;
use crate::registry::Registry;

/// Policy hooks consulted by the transport
pub trait PeerGate: Send + Sync {
    /// Raw inbound connection, before the remote identity is known
    fn allow_inbound(&self, local_addr: &Multiaddr, remote_addr: &Multiaddr) -> bool;

    /// Outbound connection to a specific address of `peer`
    fn allow_dial_addr(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// Outbound dial to `peer`
    fn allow_dial_peer(&self, peer: &PeerId) -> bool;

    /// Secure channel established with `peer`
    fn allow_secured(&self, peer: &PeerId) -> bool;
}

/// In-memory set of peers allowed to connect
#[derive(Debug, Default)]
pub struct AllowList {
    peers: RwLock<Vec<PeerId>>,
}

impl AllowList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn check(&self, peer: &PeerId) -> bool {
        self.peers.read().iter().any(|p| p == peer)
    }

    /// Allow `peer`; adding an already allowed peer is a no-op
    pub fn add(&self, peer: PeerId) {
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            debug!("Allowing peer {}", peer);
            peers.push(peer);
        }
    }

    pub fn remove(&self, peer: &PeerId) {
        self.peers.write().retain(|p| p != peer);
    }

    /// Current allow-list, in insertion order
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.peers.read().clone()
    }

    /// Rebuild the allow-list from every node stored in the registry.
    ///
    /// Identities are taken from the stored peer id and from each stored
    /// address; entries that fail to decode are skipped. The new list
    /// replaces the old one in a single write.
    pub async fn refresh(&self, registry: &dyn Registry) -> Result<usize> {
        let nodes = registry.list_nodes().await?;
        let mut fresh: Vec<PeerId> = Vec::with_capacity(nodes.len());

        for node in &nodes {
            let mut candidates = Vec::new();
            match parse_peer_id(&node.peer_id) {
                Ok(peer) => candidates.push(peer),
                Err(e) => warn!("Skipping stored identity of {}: {}", node.node_name, e),
            }
            for address in node.address_strings() {
                match parse_node_addresses(&[address.as_str()]) {
                    Ok((peer, _)) => candidates.push(peer),
                    Err(e) => warn!("Skipping address {}: {}", address, e),
                }
            }
            for peer in candidates {
                if !fresh.contains(&peer) {
                    fresh.push(peer);
                }
            }
        }

        let count = fresh.len();
        *self.peers.write() = fresh;
        info!("Allow-list refreshed with {} peers", count);
        Ok(count)
    }
}

impl PeerGate for AllowList {
    fn allow_inbound(&self, _local_addr: &Multiaddr, _remote_addr: &Multiaddr) -> bool {
        true
    }

    fn allow_dial_addr(&self, peer: &PeerId, _addr: &Multiaddr) -> bool {
        self.check(peer)
    }

    fn allow_dial_peer(&self, peer: &PeerId) -> bool {
        self.check(peer)
    }

    fn allow_secured(&self, peer: &PeerId) -> bool {
        self.check(peer)
    }
}

/// Error carried by a denied connection
#[derive(Debug, thiserror::Error)]
#[error("peer {0} is not on the allow-list")]
pub struct NotAllowed(pub String);

/// Swarm behaviour that applies a [`PeerGate`] to every connection
pub struct GateBehaviour {
    gate: Arc<dyn PeerGate>,
}

impl GateBehaviour {
    pub fn new(gate: Arc<dyn PeerGate>) -> Self {
        Self { gate }
    }

    fn deny(what: impl ToString) -> ConnectionDenied {
        ConnectionDenied::new(NotAllowed(what.to_string()))
    }
}

impl NetworkBehaviour for GateBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = ();

    fn handle_pending_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> std::result::Result<(), ConnectionDenied> {
        if self.gate.allow_inbound(local_addr, remote_addr) {
            Ok(())
        } else {
            Err(Self::deny(remote_addr))
        }
    }

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> std::result::Result<THandler<Self>, ConnectionDenied> {
        if self.gate.allow_secured(&peer) {
            Ok(dummy::ConnectionHandler)
        } else {
            debug!("Rejecting inbound connection from {}", peer);
            Err(Self::deny(peer))
        }
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        _addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> std::result::Result<Vec<Multiaddr>, ConnectionDenied> {
        match maybe_peer {
            Some(peer) if !self.gate.allow_dial_peer(&peer) => {
                debug!("Refusing to dial {}", peer);
                Err(Self::deny(peer))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> std::result::Result<THandler<Self>, ConnectionDenied> {
        if self.gate.allow_dial_addr(&peer, addr) {
            Ok(dummy::ConnectionHandler)
        } else {
            debug!("Dropping outbound connection to {} at {}", peer, addr);
            Err(Self::deny(peer))
        }
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, NewNode};
    use chrono::Utc;

    #[test]
    fn test_add_is_idempotent() {
        let gate = AllowList::new();
        let peer = PeerId::random();

        gate.add(peer);
        gate.add(peer);
        assert_eq!(gate.snapshot(), vec![peer]);

        gate.remove(&peer);
        assert!(!gate.check(&peer));
    }

    #[test]
    fn test_inbound_hook_always_allows() {
        let gate = AllowList::new();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(gate.allow_inbound(&addr, &addr));
        assert!(!gate.allow_secured(&PeerId::random()));
    }

    #[tokio::test]
    async fn test_refresh_replaces_list() {
        let registry = MemoryRegistry::new();
        let known = PeerId::random();
        registry
            .upsert_node(NewNode {
                name: "n1".to_string(),
                peer_id: known.to_string(),
                addresses: vec![format!("/ip4/10.0.0.1/tcp/4001/p2p/{}", known)],
                last_changed: Utc::now(),
            })
            .await
            .unwrap();
        registry
            .upsert_node(NewNode {
                name: "broken".to_string(),
                peer_id: "not-a-peer".to_string(),
                addresses: vec!["garbage".to_string()],
                last_changed: Utc::now(),
            })
            .await
            .unwrap();

        let gate = AllowList::new();
        let stale = PeerId::random();
        gate.add(stale);

        let count = gate.refresh(&registry).await.unwrap();
        assert_eq!(count, 1);
        assert!(gate.check(&known));
        assert!(!gate.check(&stale));
    }
}
