//! In-process registry backed by ordered maps under one lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{NewNode, Registry};
use crate::error::{FedError, Result};
use crate::model::{
    MemberEntry, MemberStatus, Network, NetworkMember, Node, NodeAddressRecord,
};

#[derive(Default)]
struct State {
    next_id: u64,
    nodes: BTreeMap<u64, Node>,
    networks: BTreeMap<u64, Network>,
    members: BTreeMap<u64, NetworkMember>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.deleted_at.is_none())
    }

    fn node_by_peer_id(&self, peer_id: &str) -> Option<&Node> {
        self.live_nodes().find(|n| n.peer_id == peer_id)
    }

    /// Rejects addresses already stored for a different node.
    ///
    /// Addresses are compared whole, `/p2p/` suffix included, so two peers
    /// sharing one transport address (NAT, container networks) never clash.
    /// Federation registration derives the peer id from the addresses, which
    /// makes a conflict reachable only through direct registry writes.
    fn check_addresses(&self, peer_id: &str, addresses: &[String]) -> Result<()> {
        for address in addresses {
            let owner = self.live_nodes().find(|n| {
                n.peer_id != peer_id && n.addresses.iter().any(|a| &a.address == address)
            });
            if let Some(owner) = owner {
                return Err(FedError::AddressConflict {
                    address: address.clone(),
                    owner: owner.peer_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn address_records(&mut self, addresses: &[String]) -> Vec<NodeAddressRecord> {
        addresses
            .iter()
            .map(|address| NodeAddressRecord {
                id: self.next_id(),
                address: address.clone(),
            })
            .collect()
    }
}

/// Registry kept entirely in memory
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().await.live_nodes().cloned().collect())
    }

    async fn list_nodes_page(&self, page: usize, limit: usize) -> Result<(Vec<Node>, usize)> {
        let state = self.state.read().await;
        let total = state.live_nodes().count();
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let rows = state.live_nodes().skip(offset).take(limit).cloned().collect();
        Ok((rows, total))
    }

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Option<Node>> {
        Ok(self.state.read().await.node_by_peer_id(peer_id).cloned())
    }

    async fn node_by_uuid(&self, uuid: Uuid) -> Result<Option<Node>> {
        Ok(self
            .state
            .read()
            .await
            .live_nodes()
            .find(|n| n.uuid == uuid)
            .cloned())
    }

    async fn node_owning_address(&self, address: &str) -> Result<Option<Node>> {
        Ok(self
            .state
            .read()
            .await
            .live_nodes()
            .find(|n| n.addresses.iter().any(|a| a.address == address))
            .cloned())
    }

    async fn upsert_node(&self, node: NewNode) -> Result<(Node, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.node_by_peer_id(&node.peer_id) {
            return Ok((existing.clone(), false));
        }
        state.check_addresses(&node.peer_id, &node.addresses)?;

        let id = state.next_id();
        let addresses = state.address_records(&node.addresses);
        let stored = Node {
            id,
            uuid: Uuid::new_v4(),
            node_name: node.name,
            peer_id: node.peer_id,
            addresses,
            last_changed: node.last_changed,
            latest_ping: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.nodes.insert(id, stored.clone());
        Ok((stored, true))
    }

    async fn update_node(
        &self,
        peer_id: &str,
        name: &str,
        addresses: &[String],
        last_changed: DateTime<Utc>,
    ) -> Result<Node> {
        let mut state = self.state.write().await;
        state.check_addresses(peer_id, addresses)?;
        let id = state
            .node_by_peer_id(peer_id)
            .map(|n| n.id)
            .ok_or_else(|| FedError::NodeNotFound(peer_id.to_string()))?;
        let records = state.address_records(addresses);

        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FedError::NodeNotFound(peer_id.to_string()))?;
        node.node_name = name.to_string();
        node.addresses = records;
        node.last_changed = last_changed;
        Ok(node.clone())
    }

    async fn remove_node(&self, peer_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .values_mut()
            .find(|n| n.peer_id == peer_id && n.deleted_at.is_none())
            .ok_or_else(|| FedError::NodeNotFound(peer_id.to_string()))?;
        node.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn record_ping(&self, peer_id: &str, at: DateTime<Utc>) -> Result<Node> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .values_mut()
            .find(|n| n.peer_id == peer_id && n.deleted_at.is_none())
            .ok_or_else(|| FedError::NodeNotFound(peer_id.to_string()))?;
        node.latest_ping = Some(at);
        Ok(node.clone())
    }

    async fn create_network_if_absent(
        &self,
        name: &str,
        password: &str,
        network_type: &str,
    ) -> Result<(Network, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.networks.values().find(|n| n.network_name == name) {
            return Ok((existing.clone(), false));
        }

        let id = state.next_id();
        let network = Network {
            id,
            network_name: name.to_string(),
            network_type: network_type.to_string(),
            network_password: password.to_string(),
            created_at: Utc::now(),
        };
        state.networks.insert(id, network.clone());
        Ok((network, true))
    }

    async fn network_by_name(&self, name: &str) -> Result<Option<Network>> {
        Ok(self
            .state
            .read()
            .await
            .networks
            .values()
            .find(|n| n.network_name == name)
            .cloned())
    }

    async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.state.read().await.networks.values().cloned().collect())
    }

    async fn network_members(&self, network_id: u64) -> Result<Vec<MemberEntry>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|m| m.network_id == network_id && m.deleted_at.is_none())
            .filter_map(|m| {
                let node = state.nodes.get(&m.node_id)?;
                node.deleted_at.is_none().then(|| MemberEntry {
                    member: m.clone(),
                    node: node.clone(),
                })
            })
            .collect())
    }

    async fn ensure_membership(
        &self,
        network_id: u64,
        node_id: u64,
        last_sync: DateTime<Utc>,
    ) -> Result<(NetworkMember, bool)> {
        let mut state = self.state.write().await;
        if !state.networks.contains_key(&network_id) {
            return Err(FedError::NetworkNotFound(network_id.to_string()));
        }
        if !state.nodes.contains_key(&node_id) {
            return Err(FedError::NodeNotFound(node_id.to_string()));
        }
        if let Some(existing) = state.members.values().find(|m| {
            m.network_id == network_id && m.node_id == node_id && m.deleted_at.is_none()
        }) {
            return Ok((existing.clone(), false));
        }

        let id = state.next_id();
        let member = NetworkMember {
            id,
            network_id,
            node_id,
            last_sync,
            status: MemberStatus::Accepted,
            deleted_at: None,
        };
        state.members.insert(id, member.clone());
        Ok((member, true))
    }

    async fn touch_member(&self, member_id: u64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or_else(|| FedError::Registry(format!("no membership {}", member_id)))?;
        member.last_sync = at;
        Ok(())
    }

    async fn memberships_of(&self, node_id: u64) -> Result<Vec<(String, NetworkMember)>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|m| m.node_id == node_id && m.deleted_at.is_none())
            .filter_map(|m| {
                let network = state.networks.get(&m.network_id)?;
                Some((network.network_name.clone(), m.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_node(name: &str, peer: &str, addresses: &[&str]) -> NewNode {
        NewNode {
            name: name.to_string(),
            peer_id: peer.to_string(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            last_changed: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing() {
        let registry = MemoryRegistry::new();
        let (first, created) = registry.upsert_node(new_node("a", "p1", &["/x"])).await.unwrap();
        assert!(created);

        let (second, created) = registry
            .upsert_node(new_node("renamed", "p1", &["/y"]))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(second.node_name, "a");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_create_one_row() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.upsert_node(new_node("a", "p1", &["/x"])).await.unwrap().1
            }));
        }

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_address_owned_by_other_node_rejected() {
        let registry = MemoryRegistry::new();
        registry.upsert_node(new_node("a", "p1", &["/shared"])).await.unwrap();

        let err = registry
            .upsert_node(new_node("b", "p2", &["/shared"]))
            .await
            .unwrap_err();
        assert!(matches!(err, FedError::AddressConflict { .. }));
    }

    #[tokio::test]
    async fn test_soft_remove_hides_node() {
        let registry = MemoryRegistry::new();
        registry.upsert_node(new_node("a", "p1", &["/x"])).await.unwrap();
        registry.remove_node("p1").await.unwrap();

        assert!(registry.node_by_peer_id("p1").await.unwrap().is_none());
        assert!(registry.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pagination() {
        let registry = MemoryRegistry::new();
        for i in 0..5 {
            let peer = format!("p{}", i);
            let addr = format!("/a{}", i);
            registry.upsert_node(new_node("n", &peer, &[&addr])).await.unwrap();
        }

        let (rows, total) = registry.list_nodes_page(2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].peer_id, "p2");

        let (rows, _) = registry.list_nodes_page(3, 2).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_membership_is_idempotent() {
        let registry = MemoryRegistry::new();
        let (network, _) = registry.create_network_if_absent("hive", "pw", "default").await.unwrap();
        let (node, _) = registry.upsert_node(new_node("a", "p1", &["/x"])).await.unwrap();

        let (_, created) = registry.ensure_membership(network.id, node.id, Utc::now()).await.unwrap();
        assert!(created);
        let (_, created) = registry.ensure_membership(network.id, node.id, Utc::now()).await.unwrap();
        assert!(!created);

        let peers = registry.network_peer_ids("hive").await.unwrap();
        assert!(peers.contains("p1"));
        assert_eq!(peers.len(), 1);
    }
}
