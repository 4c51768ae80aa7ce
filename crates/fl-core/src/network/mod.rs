//! P2P Network Module for Fedlink
//!
//! Peer identity, the libp2p swarm, and the transport abstraction the
//! overlay is written against.

pub mod behaviour;
pub mod identity;
pub mod memory;
pub mod swarm;
pub mod transport;

pub use behaviour::{FedBehaviour, FedBehaviourEvent};
pub use identity::PeerIdentity;
pub use memory::{MemoryHub, MemoryTransport};
pub use swarm::{NetworkEvent, NetworkHandle, PeerNetwork, SwarmCommand};
pub use transport::{
    tunnel_protocol_for, BoxStream, IncomingStreams, PeerStream, Transport, REQUEST_PROTOCOL,
    TUNNEL_PROTOCOL,
};
