//! Incoming side of the request bridge

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::PeerId;
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::codec::{serve_stream, BridgeRequest, BridgeResponse};
use crate::error::{FedError, Result};
use crate::network::{BoxStream, IncomingStreams};
use crate::registry::Registry;

/// How long a peer may take to send its request
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that answers bridged requests on this node
#[async_trait]
pub trait LocalService: Send + Sync {
    async fn handle(&self, peer: PeerId, req: BridgeRequest) -> Result<BridgeResponse>;
}

/// Accepts request streams, applies policy, and hands requests to a
/// [`LocalService`]
pub struct IncomingRequestHandler {
    service: Arc<dyn LocalService>,
    registry: Arc<dyn Registry>,
    path_whitelist: Vec<String>,
    restrict_to_network: Option<String>,
    read_timeout: Duration,
}

impl IncomingRequestHandler {
    pub fn new(service: Arc<dyn LocalService>, registry: Arc<dyn Registry>) -> Self {
        Self {
            service,
            registry,
            path_whitelist: Vec::new(),
            restrict_to_network: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Close streams whose request has not fully arrived within `timeout`
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Only serve paths starting with one of `prefixes` (empty = all)
    pub fn with_path_whitelist(mut self, prefixes: Vec<String>) -> Self {
        self.path_whitelist = prefixes;
        self
    }

    /// Only serve peers that are members of `network`
    pub fn restrict_to_network(mut self, network: Option<String>) -> Self {
        self.restrict_to_network = network;
        self
    }

    /// Serve every stream until the incoming side closes
    pub async fn serve(self: Arc<Self>, mut incoming: IncomingStreams) {
        while let Some((peer, stream)) = incoming.next().await {
            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                handler.handle_stream(peer, stream).await;
            });
        }
        debug!("Request stream acceptor closed");
    }

    /// Answer one stream. Policy rejections drop the stream unanswered.
    pub async fn handle_stream(&self, peer: PeerId, stream: BoxStream) {
        if let Err(e) = serve_stream(stream, self.read_timeout, |req| self.respond(peer, req)).await {
            match e {
                FedError::Rejected(_) => {}
                e => warn!("Request stream from {} failed: {}", peer, e),
            }
        }
    }

    async fn respond(&self, peer: PeerId, req: BridgeRequest) -> Result<BridgeResponse> {
        if let Err(e) = self.check_policy(&peer, &req).await {
            info!("{} {} from {}: {}", req.method, req.path, peer, e);
            return Err(e);
        }

        let (method, path) = (req.method.clone(), req.path.clone());
        let resp = match self.service.handle(peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("{} {} from {} failed: {}", method, path, peer, e);
                BridgeResponse::text(502, e.to_string())
            }
        };
        debug!("{} {} from {} -> {}", method, path, peer, resp.status);
        Ok(resp)
    }

    /// Path whitelist first, then network membership
    pub async fn check_policy(&self, peer: &PeerId, req: &BridgeRequest) -> Result<()> {
        if !self.path_whitelist.is_empty()
            && !self
                .path_whitelist
                .iter()
                .any(|prefix| req.route().starts_with(prefix.as_str()))
        {
            return Err(FedError::Rejected(format!("path {} not whitelisted", req.route())));
        }

        if let Some(network) = &self.restrict_to_network {
            let members = self.registry.network_peer_ids(network).await?;
            if !members.contains(&peer.to_string()) {
                return Err(FedError::Rejected(format!(
                    "peer is not a member of {}",
                    network
                )));
            }
        }
        Ok(())
    }
}

/// Forwards bridged requests to an HTTP service on this host
pub struct LoopbackService {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl LoopbackService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = reqwest::Url::parse(base_url)
            .map_err(|e| FedError::ConfigError(format!("{}: {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| FedError::ConfigError(e.to_string()))?;
        Ok(Self { client, base })
    }

    /// Keep the request's path and query, take everything else from the base
    fn target_url(&self, req: &BridgeRequest) -> reqwest::Url {
        let mut url = self.base.clone();
        match req.path.split_once('?') {
            Some((path, query)) => {
                url.set_path(path);
                url.set_query(Some(query));
            }
            None => {
                url.set_path(&req.path);
                url.set_query(None);
            }
        }
        url
    }
}

fn is_hop_header(name: &str) -> bool {
    ["host", "content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

#[async_trait]
impl LocalService for LoopbackService {
    async fn handle(&self, _peer: PeerId, req: BridgeRequest) -> Result<BridgeResponse> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| FedError::MalformedRequest(e.to_string()))?;

        let mut builder = self.client.request(method, self.target_url(&req));
        for (name, value) in req.headers.iter().filter(|(k, _)| !is_hop_header(k)) {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.body(req.body).send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_header(k.as_str()))
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = resp.bytes().await?.to_vec();

        Ok(BridgeResponse {
            status,
            headers,
            body,
        })
    }
}

/// Sends federation control paths to one service and everything else to
/// another
pub struct RoutedService {
    control: Arc<dyn LocalService>,
    control_routes: fn(&str) -> bool,
    fallback: Option<Arc<dyn LocalService>>,
}

impl RoutedService {
    pub fn new(
        control: Arc<dyn LocalService>,
        control_routes: fn(&str) -> bool,
        fallback: Option<Arc<dyn LocalService>>,
    ) -> Self {
        Self {
            control,
            control_routes,
            fallback,
        }
    }
}

#[async_trait]
impl LocalService for RoutedService {
    async fn handle(&self, peer: PeerId, req: BridgeRequest) -> Result<BridgeResponse> {
        if (self.control_routes)(req.route()) {
            return self.control.handle(peer, req).await;
        }
        match &self.fallback {
            Some(service) => service.handle(peer, req).await,
            None => Ok(BridgeResponse::text(404, "no local service")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_keeps_path_and_query() {
        let service = LoopbackService::new("http://127.0.0.1:8080/ignored", Duration::from_secs(1))
            .unwrap();
        let req = BridgeRequest::new("GET", "/api/v1/items?page=2");

        assert_eq!(
            service.target_url(&req).as_str(),
            "http://127.0.0.1:8080/api/v1/items?page=2"
        );
    }

    struct Counting(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl LocalService for Counting {
        async fn handle(&self, _peer: PeerId, _req: BridgeRequest) -> Result<BridgeResponse> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(BridgeResponse::new(204))
        }
    }

    #[tokio::test]
    async fn test_silent_stream_closed_after_read_timeout() {
        use tokio::io::AsyncReadExt;

        let service = Arc::new(Counting(Default::default()));
        let handler = IncomingRequestHandler::new(
            service.clone(),
            Arc::new(crate::registry::MemoryRegistry::new()),
        )
        .with_read_timeout(Duration::from_millis(100));

        let (mut client, server) = tokio::io::duplex(1024);
        tokio::time::timeout(
            Duration::from_secs(5),
            handler.handle_stream(PeerId::random(), Box::new(server)),
        )
        .await
        .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(service.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hop_headers() {
        assert!(is_hop_header("Host"));
        assert!(is_hop_header("content-length"));
        assert!(!is_hop_header("Authorization"));
    }
}
