//! Remote end of a tunnel lane: streams in, local TCP target out

use futures::StreamExt;
use libp2p::PeerId;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::bridge_bidirectional;
use super::listener::{ProxyStats, DRAIN_GRACE};
use crate::error::{FedError, Result};
use crate::network::{BoxStream, IncomingStreams};
use crate::registry::Registry;

/// Bridges accepted tunnel streams to a TCP service on this host
pub struct TunnelIngress {
    target: String,
    registry: Arc<dyn Registry>,
    restrict_to_network: Option<String>,
    stats: Arc<ProxyStats>,
}

impl TunnelIngress {
    /// `target` is a `host:port` dialed once per stream
    pub fn new(target: impl Into<String>, registry: Arc<dyn Registry>) -> Self {
        Self {
            target: target.into(),
            registry,
            restrict_to_network: None,
            stats: ProxyStats::new(),
        }
    }

    /// Only accept streams from members of `network`
    pub fn restrict_to_network(mut self, network: Option<String>) -> Self {
        self.restrict_to_network = network;
        self
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Serve streams until `incoming` ends or `shutdown` is cancelled
    pub async fn serve(self: Arc<Self>, mut incoming: IncomingStreams, shutdown: CancellationToken) {
        info!("Tunnel ingress forwarding to {}", self.target);
        let mut streams = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = incoming.next() => {
                    let Some((peer, stream)) = next else { break };
                    let ingress = Arc::clone(&self);
                    streams.spawn(async move {
                        ingress.stats.connection_opened();
                        if let Err(e) = ingress.handle_stream(peer, stream).await {
                            warn!("Tunnel stream from {} failed: {}", peer, e);
                        }
                        ingress.stats.connection_closed();
                    });
                }
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }

        if tokio::time::timeout(DRAIN_GRACE, async {
            while streams.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            streams.abort_all();
        }
        info!("Tunnel ingress to {} closed", self.target);
    }

    async fn handle_stream(&self, peer: PeerId, mut stream: BoxStream) -> Result<()> {
        if let Some(network) = &self.restrict_to_network {
            let members = self.registry.network_peer_ids(network).await?;
            if !members.contains(&peer.to_string()) {
                let _ = stream.shutdown().await;
                return Err(FedError::Rejected(format!(
                    "peer is not a member of {}",
                    network
                )));
            }
        }

        let local = match TcpStream::connect(&self.target).await {
            Ok(tcp) => tcp,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(FedError::DialError(format!("{}: {}", self.target, e)));
            }
        };

        let moved = bridge_bidirectional(stream, local).await;
        self.stats.record_received(moved.a_to_b);
        self.stats.record_sent(moved.b_to_a);
        debug!(
            "Tunnel from {} done: {} bytes in, {} bytes out",
            peer, moved.a_to_b, moved.b_to_a
        );
        Ok(())
    }
}
