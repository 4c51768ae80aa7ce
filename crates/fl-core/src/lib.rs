//! Fedlink Core Library
//!
//! This crate provides the overlay logic of a Fedlink node:
//! - a libp2p swarm guarded by an allow-list connection gate
//! - HTTP/1.1 requests bridged over peer streams
//! - raw TCP tunnels with in-band TLS upgrade
//! - password-gated networks kept in sync by pairwise anti-entropy

pub mod address;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod federation;
pub mod gate;
pub mod model;
pub mod network;
pub mod proxy;
pub mod registry;
pub mod sync;
pub mod tls;
pub mod tunnel;

pub use address::{parse_node_addresses, parse_peer_id, NodeAddress};
pub use auth::SessionStore;
pub use bridge::{
    BridgeRequest, BridgeResponse, IncomingRequestHandler, LocalService, LoopbackService,
    RequestBridge, RoutedService,
};
pub use config::FedConfig;
pub use control::{is_control_path, ControlService, CONTROL_PREFIX};
pub use error::{FedError, Result};
pub use federation::{Applied, Federation, IdentityInfo};
pub use gate::{AllowList, GateBehaviour, PeerGate};
pub use model::{Network, NetworkMember, Node, NodeSyncInfo, RegisterNode};
pub use network::{
    MemoryHub, MemoryTransport, NetworkEvent, NetworkHandle, PeerIdentity, PeerNetwork,
    Transport, REQUEST_PROTOCOL, TUNNEL_PROTOCOL,
};
pub use proxy::{LaneInfo, ProxyDescriptor, ProxyManager, ProxySpec};
pub use registry::{MemoryRegistry, Registry};
pub use sync::{NetworkSyncer, PassReport, SyncSupervisor};
pub use tunnel::{TunnelIngress, TunnelListener};

// Re-export libp2p types we expose
pub use libp2p::{Multiaddr, PeerId, StreamProtocol};
