//! TCP Tunnel
//!
//! Raw byte tunnels between a local TCP port and a service behind a remote
//! peer, with optional in-band TLS upgrade on the listening side.

pub mod bridge;
pub mod ingress;
pub mod listener;
pub mod sniff;

pub use bridge::{bridge_bidirectional, Transferred};
pub use ingress::TunnelIngress;
pub use listener::{ProxyStats, StatsSnapshot, TunnelListener};
pub use sniff::SSL_REQUEST;
