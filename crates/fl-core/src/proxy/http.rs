//! Local HTTP listener of an egress HTTP lane
//!
//! One request per connection: the request is served with the bridge codec,
//! relayed to the target peer, and its response written back.

use libp2p::{PeerId, StreamProtocol};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::codec::serve_stream;
use crate::bridge::{BridgeRequest, BridgeResponse};
use crate::error::{FedError, Result};
use crate::federation::Federation;
use crate::tunnel::listener::{ProxyStats, DRAIN_GRACE};

/// How long a local client may take to send its request
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpEgress {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

struct Relay {
    federation: Arc<Federation>,
    target_peer: String,
    protocol: StreamProtocol,
    stats: Arc<ProxyStats>,
}

impl HttpEgress {
    pub async fn bind(
        addr: &str,
        federation: Arc<Federation>,
        target_peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FedError::PortBindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!("HTTP lane listening on {} -> {}", local_addr, target_peer);

        Ok(Self {
            listener,
            local_addr,
            relay: Arc::new(Relay {
                federation,
                target_peer: target_peer.to_string(),
                protocol,
                stats: ProxyStats::new(),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.relay.stats)
    }

    pub fn closer(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        let mut requests = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((tcp, from)) => {
                        let relay = Arc::clone(&self.relay);
                        requests.spawn(async move {
                            relay.stats.connection_opened();
                            if let Err(e) = relay.serve(tcp).await {
                                warn!("HTTP lane request from {} failed: {}", from, e);
                            }
                            relay.stats.connection_closed();
                        });
                    }
                    Err(e) => error!("Accept error on {}: {}", self.local_addr, e),
                },
                Some(_) = requests.join_next(), if !requests.is_empty() => {}
            }
        }

        drop(self.listener);
        if tokio::time::timeout(DRAIN_GRACE, async {
            while requests.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            requests.abort_all();
        }
        info!("HTTP lane on {} closed", self.local_addr);
    }
}

impl Relay {
    async fn serve(&self, tcp: TcpStream) -> Result<()> {
        serve_stream(tcp, CLIENT_READ_TIMEOUT, |req| self.forward(req)).await
    }

    /// Relay errors become plain-text answers to the local client
    async fn forward(&self, req: BridgeRequest) -> Result<BridgeResponse> {
        self.stats.record_sent(req.body.len() as u64);

        let resp = match self
            .federation
            .bridge()
            .send_to_peer(&self.target_peer, self.protocol.clone(), &req)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                debug!("{} {} to {} failed: {}", req.method, req.path, self.target_peer, e);
                BridgeResponse::text(e.status_code(), e.to_string())
            }
        };
        self.stats.record_received(resp.body.len() as u64);
        Ok(resp)
    }
}
