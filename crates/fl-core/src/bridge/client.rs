//! Outgoing side of the request bridge

use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::codec::{send_request, BridgeRequest, BridgeResponse};
use crate::address::{parse_peer_id, NodeAddress};
use crate::error::{FedError, Result};
use crate::model::Node;
use crate::network::Transport;
use crate::registry::Registry;

/// Sends HTTP/1.1 requests to peers over streams
pub struct RequestBridge {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    timeout: Duration,
}

impl RequestBridge {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn Registry>, timeout: Duration) -> Self {
        Self {
            transport,
            registry,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `req` to `node` and wait for its response.
    ///
    /// The node's stored addresses are handed to the transport first. An
    /// address that fails to parse is skipped; the call only fails if none
    /// of them could be used.
    pub async fn send(
        &self,
        node: &Node,
        protocol: StreamProtocol,
        req: &BridgeRequest,
    ) -> Result<BridgeResponse> {
        let peer = parse_peer_id(&node.peer_id)?;
        self.register_addresses(&peer, node).await?;
        self.exchange(peer, protocol, req).await
    }

    /// Look the node up by identity, then [`send`](Self::send)
    pub async fn send_to_peer(
        &self,
        peer_id: &str,
        protocol: StreamProtocol,
        req: &BridgeRequest,
    ) -> Result<BridgeResponse> {
        let node = self
            .registry
            .node_by_peer_id(peer_id)
            .await?
            .ok_or_else(|| FedError::NodeNotFound(peer_id.to_string()))?;
        self.send(&node, protocol, req).await
    }

    async fn register_addresses(&self, peer: &PeerId, node: &Node) -> Result<()> {
        let mut transports = Vec::new();
        for raw in node.address_strings() {
            match NodeAddress::parse(&raw) {
                Ok(addr) if addr.peer_id() == peer => transports.push(addr.transport().clone()),
                Ok(_) => warn!("Address {} of {} names another peer", raw, node.node_name),
                Err(e) => warn!("Skipping address of {}: {}", node.node_name, e),
            }
        }

        if transports.is_empty() {
            return Err(FedError::InvalidAddress(format!(
                "no usable address for {}",
                node.peer_id
            )));
        }
        self.transport.add_addresses(*peer, transports).await
    }

    async fn exchange(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        req: &BridgeRequest,
    ) -> Result<BridgeResponse> {
        let exchange = async {
            let stream = self.transport.open_stream(peer, protocol.clone()).await?;
            debug!("{} {} -> {} over {}", req.method, req.path, peer, protocol);
            send_request(stream, req).await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                FedError::Timeout(format!(
                    "{} {} to {} after {:?}",
                    req.method, req.path, peer, self.timeout
                ))
            })?
    }
}
