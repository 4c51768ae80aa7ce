//! Network Behaviour for Fedlink
//!
//! Combines libp2p protocols for the overlay:
//! - Gate: allow-list policy applied to every connection
//! - Identify: Peer info exchange
//! - Ping: Connection liveness
//! - Stream: Raw bidirectional streams for requests and tunnels

use libp2p::{identify, ping, swarm::NetworkBehaviour};

use crate::gate::GateBehaviour;

/// Combined network behaviour for Fedlink
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "FedBehaviourEvent")]
pub struct FedBehaviour {
    /// Connection gate, consulted before the other behaviours
    pub gate: GateBehaviour,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping protocol for connection liveness
    pub ping: ping::Behaviour,
    /// Stream behaviour for request and tunnel streams
    pub stream: libp2p_stream::Behaviour,
}

/// Events emitted by the Fedlink behaviour
#[derive(Debug)]
pub enum FedBehaviourEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    /// Gate and stream behaviours emit nothing
    #[allow(dead_code)]
    Silent(()),
}

impl From<identify::Event> for FedBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        FedBehaviourEvent::Identify(event)
    }
}

impl From<ping::Event> for FedBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        FedBehaviourEvent::Ping(event)
    }
}

impl From<()> for FedBehaviourEvent {
    fn from(_: ()) -> Self {
        FedBehaviourEvent::Silent(())
    }
}
