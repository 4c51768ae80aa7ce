//! Helpers shared by the integration tests: in-process nodes wired over a
//! `MemoryHub`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fl_core::gate::PeerGate;
use fl_core::network::Transport;
use fl_core::{
    is_control_path, AllowList, ControlService, Federation, IncomingRequestHandler, LocalService,
    MemoryHub, MemoryRegistry, MemoryTransport, NetworkSyncer, PeerId, RegisterNode,
    RoutedService, REQUEST_PROTOCOL,
};

pub const PASSWORD: &str = "correct horse";

pub struct TestNode {
    pub peer: PeerId,
    pub transport: MemoryTransport,
    pub registry: Arc<MemoryRegistry>,
    pub gate: Arc<AllowList>,
    pub federation: Arc<Federation>,
    pub syncer: Arc<NetworkSyncer>,
}

impl TestNode {
    /// Self-describing addresses other nodes register this node with
    pub fn addresses(&self) -> Vec<String> {
        self.federation.connect_addresses()
    }

    pub async fn register(&self, other: &TestNode, network: Option<&str>) {
        let mut reg = RegisterNode::new(other.federation.node_name(), other.addresses());
        if let Some(network) = network {
            reg = reg.in_network(network);
        }
        self.federation.register_node(reg).await.unwrap();
    }

    pub async fn member_peers(&self, network: &str) -> Vec<String> {
        use fl_core::Registry;
        let mut peers: Vec<String> = self
            .registry
            .network_peer_ids(network)
            .await
            .unwrap()
            .into_iter()
            .collect();
        peers.sort();
        peers
    }
}

/// Join `hub` as a new node serving the control endpoints, with `fallback`
/// answering every other path
pub async fn spawn_node(
    hub: &MemoryHub,
    name: &str,
    gated: bool,
    fallback: Option<Arc<dyn LocalService>>,
) -> TestNode {
    let peer = PeerId::random();
    let gate = AllowList::new();
    let hub_gate = gated.then(|| Arc::clone(&gate) as Arc<dyn PeerGate>);
    let transport = hub.join(peer, hub_gate);
    let registry = Arc::new(MemoryRegistry::new());

    let federation = Federation::new(
        name,
        Arc::new(transport.clone()),
        registry.clone(),
        Arc::clone(&gate),
        Duration::from_secs(5),
    );
    federation.ensure_own_node().await.unwrap();

    let service = RoutedService::new(
        Arc::new(ControlService::new(Arc::clone(&federation))),
        is_control_path,
        fallback,
    );
    let handler = Arc::new(IncomingRequestHandler::new(Arc::new(service), registry.clone()));
    tokio::spawn(handler.serve(transport.accept(REQUEST_PROTOCOL).unwrap()));

    let syncer = Arc::new(NetworkSyncer::new(
        Arc::clone(&federation),
        Duration::from_secs(60),
    ));

    TestNode {
        peer,
        transport,
        registry,
        gate,
        federation,
        syncer,
    }
}

/// Link every pair of `nodes` on the hub
pub fn link_all(hub: &MemoryHub, nodes: &[&TestNode]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            hub.link(&a.peer, &b.peer);
        }
    }
}
