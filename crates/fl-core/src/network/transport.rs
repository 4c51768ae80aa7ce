//! Stream Transport Abstraction
//!
//! The overlay only needs two primitives from the secure transport: open a
//! stream to a peer under a protocol, and accept streams under a protocol.
//! Both the libp2p swarm and the in-process hub implement them.

use async_trait::async_trait;
use futures::Stream;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{FedError, Result};

/// Protocol of the request bridge, control calls included
pub const REQUEST_PROTOCOL: StreamProtocol = StreamProtocol::new("/fedlink/request/1.0.0");

/// Protocol of the default raw TCP tunnel
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/fedlink/tunnel/1.0.0");

/// A bidirectional byte stream to a peer
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxStream = Box<dyn PeerStream>;

/// Streams opened by remote peers under one protocol
pub type IncomingStreams = Pin<Box<dyn Stream<Item = (PeerId, BoxStream)> + Send>>;

/// What the overlay consumes from the secure transport
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Transport addresses this node listens on, without `/p2p/`
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Record dialable addresses of `peer`
    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()>;

    /// Open a stream to `peer`, connecting first if needed
    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<BoxStream>;

    /// Start accepting streams under `protocol`. A protocol can only be
    /// accepted once per transport.
    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams>;
}

/// Derive the protocol of one tunnel lane, so several lanes between the
/// same two peers do not collide.
pub fn tunnel_protocol_for(
    origin_port: u16,
    origin_peer: &PeerId,
    target_port: u16,
    target_peer: &PeerId,
) -> Result<StreamProtocol> {
    let digest = Sha256::digest(
        format!("{}:{}:{}:{}", origin_port, origin_peer, target_port, target_peer).as_bytes(),
    );
    StreamProtocol::try_from_owned(format!("/fedlink/tunnel-{}/1.0.0", hex::encode(digest)))
        .map_err(|e| FedError::InvalidProxy(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_protocol_is_stable_per_lane() {
        let a = PeerId::random();
        let b = PeerId::random();

        let first = tunnel_protocol_for(5432, &a, 5433, &b).unwrap();
        let again = tunnel_protocol_for(5432, &a, 5433, &b).unwrap();
        let other = tunnel_protocol_for(5432, &a, 5434, &b).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(first.as_ref().starts_with("/fedlink/tunnel-"));
    }
}
