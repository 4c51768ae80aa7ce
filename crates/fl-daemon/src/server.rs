//! Daemon Server
//!
//! Brings a node up: swarm, registry, request bridge, sync supervisor,
//! proxy lanes and the admin API, then forwards network events until told
//! to shut down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fl_core::bridge::{IncomingRequestHandler, LocalService, LoopbackService, RoutedService};
use fl_core::gate::PeerGate;
use fl_core::network::Transport;
use fl_core::{
    is_control_path, AllowList, ControlService, FedConfig, FedError, Federation, MemoryRegistry,
    NetworkEvent, NetworkHandle, NetworkSyncer, PeerIdentity, PeerNetwork, ProxyManager,
    RegisterNode, Registry, Result, CONTROL_PREFIX, REQUEST_PROTOCOL,
};

use crate::api::{self, ApiState};

/// How long startup waits for the swarm to report a listen address
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Expired network sessions are dropped this often
pub const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Events from the daemon to its owner
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Node is up and the admin API is serving
    Ready { peer_id: String, api_addr: String },

    /// Listening on address
    Listening { address: String },

    /// Peer connected
    PeerConnected { peer_id: String },

    /// Peer disconnected
    PeerDisconnected { peer_id: String },

    /// Error occurred
    Error { message: String },

    /// Shutdown
    Shutdown,
}

/// Commands to the daemon
#[derive(Debug)]
pub enum DaemonCommand {
    /// Rebuild the allow-list from the registry
    RefreshGate,

    /// Shutdown daemon
    Shutdown,
}

/// Main daemon server
pub struct DaemonServer {
    config: FedConfig,
    network: NetworkHandle,
    swarm_task: Option<JoinHandle<()>>,
    network_rx: mpsc::Receiver<NetworkEvent>,
    api: Arc<ApiState>,
    api_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    event_rx: mpsc::Receiver<DaemonEvent>,
    command_tx: mpsc::Sender<DaemonCommand>,
    command_rx: mpsc::Receiver<DaemonCommand>,
}

impl DaemonServer {
    /// Start the swarm and build the node state
    pub async fn new(config: FedConfig) -> Result<Self> {
        config.validate()?;

        let identity = PeerIdentity::load_or_generate(&config.identity_path)?;
        let gate = AllowList::new();
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());

        let mut network = PeerNetwork::new(identity, Arc::clone(&gate) as Arc<dyn PeerGate>)?;
        network.start_listening(config.listen_port)?;
        let mut network_rx = network.take_event_receiver().ok_or_else(|| {
            FedError::NetworkInitialization("event receiver already taken".to_string())
        })?;
        let handle = network.handle();
        let swarm_task = network.spawn();

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);

        // The own record needs at least one concrete listen address
        let first = tokio::time::timeout(LISTEN_TIMEOUT, async {
            while let Some(event) = network_rx.recv().await {
                if let NetworkEvent::Listening { address } = event {
                    return Some(address);
                }
            }
            None
        })
        .await
        .map_err(|_| FedError::Timeout("waiting for a listen address".to_string()))?
        .ok_or_else(|| FedError::NetworkInitialization("swarm stopped".to_string()))?;
        let _ = event_tx.try_send(DaemonEvent::Listening {
            address: first.to_string(),
        });

        let federation = Federation::new(
            config.node_name.clone(),
            Arc::new(handle.clone()),
            registry,
            gate,
            config.request_timeout(),
        );
        federation.ensure_own_node().await?;

        let syncer = Arc::new(NetworkSyncer::new(
            Arc::clone(&federation),
            config.sync_staleness(),
        ));
        let proxies = Arc::new(ProxyManager::new(Arc::clone(&federation)));
        let api = Arc::new(ApiState {
            federation,
            syncer,
            proxies,
            admin_token: config.admin_token.clone(),
            sync_interval: config.sync_interval(),
        });

        Ok(Self {
            config,
            network: handle,
            swarm_task: Some(swarm_task),
            network_rx,
            api,
            api_addr: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            event_tx,
            event_rx,
            command_tx,
            command_rx,
        })
    }

    /// Get the command sender
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// Take the event receiver
    pub fn take_event_receiver(&mut self) -> mpsc::Receiver<DaemonEvent> {
        let (new_tx, new_rx) = mpsc::channel(256);
        let old_rx = std::mem::replace(&mut self.event_rx, new_rx);
        self.event_tx = new_tx;
        old_rx
    }

    pub fn federation(&self) -> &Arc<Federation> {
        &self.api.federation
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    /// Serve peers and the admin API, seed networks, nodes and lanes
    pub async fn start(&mut self) -> Result<SocketAddr> {
        info!("Starting Fedlink daemon...");
        let federation = Arc::clone(&self.api.federation);

        self.serve_requests()?;

        for seed in &self.config.networks {
            if let Err(e) = self.api.bootstrap_network(&seed.name, &seed.password).await {
                error!("Failed to set up network {}: {}", seed.name, e);
            }
        }

        for seed in &self.config.nodes {
            let mut reg = RegisterNode::new(seed.name.clone(), seed.addresses.clone());
            reg.add_to_network = seed.add_to_network.clone();
            match federation.register_node(reg).await {
                Ok(node) => debug!("Seed node {} registered", node.peer_id),
                Err(e) => warn!("Failed to register seed node {}: {}", seed.name, e),
            }
        }

        let peers = federation.refresh_gate().await?;
        info!("Allow-list holds {} peers", peers);

        let started = self
            .api
            .proxies
            .start_all(self.config.proxy_descriptors()?)
            .await;
        if started > 0 {
            info!("Started {} proxy lanes", started);
        }

        let sessions = Arc::clone(&federation);
        let token = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => sessions.sessions().purge_expired(),
                }
            }
        }));

        let addr = self.serve_api().await?;
        let _ = self
            .event_tx
            .send(DaemonEvent::Ready {
                peer_id: federation.local_peer_id().to_string(),
                api_addr: addr.to_string(),
            })
            .await;
        Ok(addr)
    }

    fn serve_requests(&mut self) -> Result<()> {
        let federation = &self.api.federation;

        let fallback = match &self.config.local_service_url {
            Some(url) => Some(
                Arc::new(LoopbackService::new(url, self.config.request_timeout())?)
                    as Arc<dyn LocalService>,
            ),
            None => None,
        };
        let service = RoutedService::new(
            Arc::new(ControlService::new(Arc::clone(federation))),
            is_control_path,
            fallback,
        );

        let mut whitelist = self.config.path_prefix_whitelist.clone();
        if !whitelist.is_empty() && !whitelist.iter().any(|p| p == CONTROL_PREFIX) {
            whitelist.push(CONTROL_PREFIX.to_string());
        }

        let handler = Arc::new(
            IncomingRequestHandler::new(Arc::new(service), Arc::clone(federation.registry()))
                .with_path_whitelist(whitelist)
                .restrict_to_network(self.config.restrict_to_network.clone())
                .with_read_timeout(self.config.request_timeout()),
        );
        let incoming = self.network.accept(REQUEST_PROTOCOL)?;
        self.tasks.push(tokio::spawn(handler.serve(incoming)));
        Ok(())
    }

    async fn serve_api(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.api_bind)
            .await
            .map_err(|e| FedError::PortBindFailed {
                addr: self.config.api_bind.clone(),
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr()?;
        info!("Admin API listening on {}", addr);

        let router = api::router(Arc::clone(&self.api));
        let token = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("Admin API stopped: {}", e);
            }
        }));

        self.api_addr = Some(addr);
        Ok(addr)
    }

    /// Run the daemon main loop
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(DaemonCommand::RefreshGate) => {
                            match self.api.federation.refresh_gate().await {
                                Ok(peers) => info!("Allow-list refreshed: {} peers", peers),
                                Err(e) => {
                                    error!("Allow-list refresh failed: {}", e);
                                    let _ = self.event_tx.send(DaemonEvent::Error {
                                        message: e.to_string(),
                                    }).await;
                                }
                            }
                        }
                        Some(DaemonCommand::Shutdown) | None => {
                            info!("Shutdown command received");
                            break;
                        }
                    }
                }

                Some(event) = self.network_rx.recv() => {
                    // later listeners (other interfaces, QUIC) extend the own record
                    if matches!(event, NetworkEvent::Listening { .. }) {
                        if let Err(e) = self.api.federation.ensure_own_node().await {
                            warn!("Failed to update own node record: {}", e);
                        }
                    }
                    Self::handle_network_event(&self.event_tx, event).await;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        self.api.federation.supervisor().stop_all();
        self.api.proxies.stop_all().await;
        self.shutdown.cancel();

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.network.shutdown().await {
            debug!("Swarm already stopped: {}", e);
        }
        if let Some(task) = self.swarm_task.take() {
            let _ = task.await;
        }

        let _ = self.event_tx.send(DaemonEvent::Shutdown).await;
        info!("Fedlink daemon stopped");
    }

    /// Handle a network event (static method for use in run loop)
    async fn handle_network_event(event_tx: &mpsc::Sender<DaemonEvent>, event: NetworkEvent) {
        match event {
            NetworkEvent::Listening { address } => {
                let _ = event_tx
                    .send(DaemonEvent::Listening {
                        address: address.to_string(),
                    })
                    .await;
            }
            NetworkEvent::PeerConnected { peer_id } => {
                let _ = event_tx
                    .send(DaemonEvent::PeerConnected {
                        peer_id: peer_id.to_string(),
                    })
                    .await;
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                let _ = event_tx
                    .send(DaemonEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    })
                    .await;
            }
            NetworkEvent::DialFailed { peer_id, message } => {
                let _ = event_tx
                    .send(DaemonEvent::Error {
                        message: format!("dial {} failed: {}", peer_id, message),
                    })
                    .await;
            }
        }
    }
}
