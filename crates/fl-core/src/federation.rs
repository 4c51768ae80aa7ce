//! Federation state of one node
//!
//! Ties the registry, connection gate, transport and request bridge
//! together and implements the registration rules every entry point shares:
//! operator registration, descriptors learned during sync, and the node's
//! own record.

use chrono::{Duration as ChronoDuration, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::address::parse_node_addresses;
use crate::auth::SessionStore;
use crate::bridge::RequestBridge;
use crate::error::{FedError, Result};
use crate::gate::AllowList;
use crate::model::{Network, Node, NodeSyncInfo, RegisterNode};
use crate::network::Transport;
use crate::registry::{NewNode, Registry};
use crate::sync::SyncSupervisor;

/// Network type stored for networks created through this node
pub const DEFAULT_NETWORK_TYPE: &str = "default";

/// How far in the past new memberships are marked as synced, so the next
/// pass picks them up straight away
pub const NEW_MEMBER_BACKDATE_MINUTES: i64 = 5;

/// Local identity as published by the identity endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityInfo {
    pub id: String,
    pub addresses: Vec<String>,
    pub connect_multiadress: Vec<String>,
}

/// What applying a learned descriptor did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Everything a node needs to take part in the overlay
pub struct Federation {
    node_name: String,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    gate: Arc<AllowList>,
    bridge: RequestBridge,
    sessions: SessionStore,
    supervisor: SyncSupervisor,
}

impl Federation {
    pub fn new(
        node_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        gate: Arc<AllowList>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let bridge = RequestBridge::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            request_timeout,
        );
        Arc::new(Self {
            node_name: node_name.into(),
            transport,
            registry,
            gate,
            bridge,
            sessions: SessionStore::default(),
            supervisor: SyncSupervisor::new(),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<AllowList> {
        &self.gate
    }

    pub fn bridge(&self) -> &RequestBridge {
        &self.bridge
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn supervisor(&self) -> &SyncSupervisor {
        &self.supervisor
    }

    /// Self-describing addresses peers use to reach this node
    pub fn connect_addresses(&self) -> Vec<String> {
        let peer = self.local_peer_id();
        self.transport
            .listen_addrs()
            .iter()
            .map(|addr| crate::address::NodeAddress::connect_address(addr, &peer).to_string())
            .collect()
    }

    pub fn identity(&self) -> IdentityInfo {
        IdentityInfo {
            id: self.local_peer_id().to_string(),
            addresses: self
                .transport
                .listen_addrs()
                .iter()
                .map(Multiaddr::to_string)
                .collect(),
            connect_multiadress: self.connect_addresses(),
        }
    }

    /// Register this node in its own registry, refreshing its addresses if
    /// they changed since the last start
    pub async fn ensure_own_node(&self) -> Result<Node> {
        let addresses = self.connect_addresses();
        let peer_id = self.local_peer_id().to_string();

        if let Some(existing) = self.registry.node_by_peer_id(&peer_id).await? {
            let mut stored = existing.address_strings();
            let mut current = addresses.clone();
            stored.sort();
            current.sort();
            if stored == current && existing.node_name == self.node_name {
                return Ok(existing);
            }
            info!("Local addresses changed, updating own record");
            return self
                .registry
                .update_node(&peer_id, &self.node_name, &addresses, Utc::now())
                .await;
        }

        let (node, _) = self
            .registry
            .upsert_node(NewNode {
                name: self.node_name.clone(),
                peer_id,
                addresses,
                last_changed: Utc::now(),
            })
            .await?;
        Ok(node)
    }

    /// Register a node from its self-describing addresses.
    ///
    /// All addresses must parse and name the same peer. A node that is
    /// already known is returned unchanged, but the requested network
    /// membership is still ensured. New nodes are allowed through the gate
    /// right away.
    pub async fn register_node(&self, reg: RegisterNode) -> Result<Node> {
        let (peer, parsed) = parse_node_addresses(&reg.addresses)?;
        let addresses: Vec<String> = parsed.iter().map(ToString::to_string).collect();

        let (node, created) = self
            .registry
            .upsert_node(NewNode {
                name: reg.name.clone(),
                peer_id: peer.to_string(),
                addresses,
                last_changed: reg.last_changed.unwrap_or_else(Utc::now),
            })
            .await?;

        if peer != self.local_peer_id() {
            self.gate.add(peer);
            self.transport
                .add_addresses(peer, parsed.iter().map(|a| a.transport().clone()).collect())
                .await?;
        }
        if created {
            info!("Registered node {} ({})", node.node_name, node.peer_id);
        }

        if let Some(network_name) = &reg.add_to_network {
            self.join_network(network_name, &node).await?;
        }
        Ok(node)
    }

    async fn join_network(&self, network_name: &str, node: &Node) -> Result<()> {
        let network = self
            .registry
            .network_by_name(network_name)
            .await?
            .ok_or_else(|| FedError::NetworkNotFound(network_name.to_string()))?;
        let last_sync = Utc::now() - ChronoDuration::minutes(NEW_MEMBER_BACKDATE_MINUTES);
        let (_, added) = self
            .registry
            .ensure_membership(network.id, node.id, last_sync)
            .await?;
        if added {
            info!("Node {} joined network {}", node.peer_id, network_name);
        }
        Ok(())
    }

    /// Merge a descriptor learned from a peer into `network`.
    ///
    /// Unknown nodes are registered. Known nodes are updated only when the
    /// descriptor is newer than the stored copy. The local node is never
    /// changed by a peer.
    pub async fn apply_descriptor(&self, network: &Network, info: NodeSyncInfo) -> Result<Applied> {
        let (peer, _) = parse_node_addresses(&info.addresses)?;
        if peer.to_string() != info.peer_id {
            return Err(FedError::InvalidAddress(format!(
                "addresses of {} name peer {}",
                info.peer_id, peer
            )));
        }
        if peer == self.local_peer_id() {
            return Ok(Applied::Unchanged);
        }

        let existing = self.registry.node_by_peer_id(&info.peer_id).await?;
        let applied = match existing {
            None => {
                let reg = info.into_registration(&network.network_name);
                self.register_node(reg).await?;
                return Ok(Applied::Created);
            }
            Some(node) if info.last_updated > node.last_changed => {
                debug!("Updating {} from a newer descriptor", info.peer_id);
                self.registry
                    .update_node(&info.peer_id, &info.name, &info.addresses, info.last_updated)
                    .await?;
                Applied::Updated
            }
            Some(_) => Applied::Unchanged,
        };

        let reg = info.into_registration(&network.network_name);
        self.register_node(reg).await?;
        Ok(applied)
    }

    /// Create a network unless it exists, make this node a member and
    /// provision its service account
    pub async fn create_network(&self, name: &str, password: &str) -> Result<(Network, bool)> {
        if name.is_empty() {
            return Err(FedError::MalformedRequest("network name is empty".to_string()));
        }

        let (network, created) = self
            .registry
            .create_network_if_absent(name, password, DEFAULT_NETWORK_TYPE)
            .await?;
        let own = self.ensure_own_node().await?;
        self.registry
            .ensure_membership(network.id, own.id, Utc::now())
            .await?;
        self.sessions.provision(name, &network.network_password);

        if created {
            info!("Created network {}", name);
        }
        Ok((network, created))
    }

    /// Record a liveness timestamp for a node
    pub async fn record_ping(&self, peer_id: &str) -> Result<Node> {
        self.registry.record_ping(peer_id, Utc::now()).await
    }

    /// Rebuild the allow-list from the registry
    pub async fn refresh_gate(&self) -> Result<usize> {
        self.gate.refresh(self.registry.as_ref()).await
    }
}
