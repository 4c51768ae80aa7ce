//! Proxy lanes
//!
//! A lane exposes a service across the overlay: egress lanes listen on a
//! local port and forward to a peer, ingress lanes accept streams from
//! peers and forward to a service on this host.

pub mod descriptor;
pub mod http;
pub mod manager;

pub use descriptor::{Direction, LaneSide, ProxyDescriptor, ProxyKind, ProxySpec, TlsFiles};
pub use http::HttpEgress;
pub use manager::{LaneInfo, ProxyManager};
