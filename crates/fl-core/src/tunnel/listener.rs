//! TCP Listener for tunnel lanes
//!
//! Accepts local TCP connections and bridges each one to a stream opened
//! towards the remote peer.

use libp2p::{PeerId, StreamProtocol};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::bridge_bidirectional;
use super::sniff;
use crate::error::{FedError, Result};
use crate::network::{BoxStream, Transport};

/// In-flight connections get this long to finish after the listener closes
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Statistics for one lane
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections_total: u64,
    pub connections_active: u64,
}

struct Lane {
    transport: Arc<dyn Transport>,
    remote_peer: PeerId,
    protocol: StreamProtocol,
    tls: Option<TlsAcceptor>,
    stats: Arc<ProxyStats>,
}

/// Local end of an egress tunnel lane
pub struct TunnelListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    lane: Arc<Lane>,
    shutdown: CancellationToken,
}

impl TunnelListener {
    /// Bind `addr` and prepare to tunnel to `remote_peer` under `protocol`.
    /// With `tls` set, connections must open with an upgrade request.
    pub async fn bind(
        addr: &str,
        transport: Arc<dyn Transport>,
        remote_peer: PeerId,
        protocol: StreamProtocol,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FedError::PortBindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Tunnel listening on {} -> {} ({}){}",
            local_addr,
            remote_peer,
            protocol,
            if tls.is_some() { " with TLS" } else { "" }
        );

        Ok(Self {
            listener,
            local_addr,
            lane: Arc::new(Lane {
                transport,
                remote_peer,
                protocol,
                tls: tls.map(TlsAcceptor::from),
                stats: ProxyStats::new(),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.lane.stats)
    }

    /// Token that stops [`run`](Self::run) once cancelled
    pub fn closer(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run the accept loop until closed, then drain connections
    pub async fn run(self) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((tcp, peer_addr)) => {
                            debug!("Accepted {} on {}", peer_addr, self.local_addr);
                            let lane = Arc::clone(&self.lane);
                            connections.spawn(async move {
                                lane.stats.connection_opened();
                                if let Err(e) = lane.handle_connection(tcp).await {
                                    warn!("Tunnel connection from {} failed: {}", peer_addr, e);
                                }
                                lane.stats.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", self.local_addr, e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} tunnel connections on {}",
                connections.len(),
                self.local_addr
            );
            connections.abort_all();
        }
        info!("Tunnel on {} closed", self.local_addr);
    }
}

impl Lane {
    async fn handle_connection(&self, tcp: TcpStream) -> Result<()> {
        let local: BoxStream = match &self.tls {
            Some(acceptor) => match sniff::upgrade(tcp, acceptor).await? {
                Some(upgraded) => upgraded,
                None => return Ok(()),
            },
            None => Box::new(tcp),
        };

        let remote = match self
            .transport
            .open_stream(self.remote_peer, self.protocol.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let mut local = local;
                let _ = local.shutdown().await;
                return Err(e);
            }
        };

        let moved = bridge_bidirectional(local, remote).await;
        self.stats.record_sent(moved.a_to_b);
        self.stats.record_received(moved.b_to_a);
        debug!(
            "Tunnel to {} done: {} bytes out, {} bytes in",
            self.remote_peer, moved.a_to_b, moved.b_to_a
        );
        Ok(())
    }
}
