//! Node Registry
//!
//! The persisted view of the overlay: nodes with their addresses, networks
//! and network memberships. The storage engine is pluggable; every write is
//! an upsert keyed by the natural key (peer identity, network name,
//! network/node pair) so concurrent callers never create duplicates.

mod memory;

pub use memory::MemoryRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{MemberEntry, Network, NetworkMember, Node};

/// Fields of a node about to be stored
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub last_changed: DateTime<Utc>,
}

/// Storage operations the overlay needs
#[async_trait]
pub trait Registry: Send + Sync {
    /// All live nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// One page (1-based) of live nodes plus the total count
    async fn list_nodes_page(&self, page: usize, limit: usize) -> Result<(Vec<Node>, usize)>;

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Option<Node>>;

    async fn node_by_uuid(&self, uuid: Uuid) -> Result<Option<Node>>;

    /// The live node that stores `address`, if any
    async fn node_owning_address(&self, address: &str) -> Result<Option<Node>>;

    /// Insert a node unless one with the same peer identity exists.
    /// Returns the stored node and whether it was created.
    async fn upsert_node(&self, node: NewNode) -> Result<(Node, bool)>;

    /// Replace name, addresses and change timestamp of a node
    async fn update_node(
        &self,
        peer_id: &str,
        name: &str,
        addresses: &[String],
        last_changed: DateTime<Utc>,
    ) -> Result<Node>;

    /// Soft-remove a node; it disappears from listings but keeps its row
    async fn remove_node(&self, peer_id: &str) -> Result<()>;

    async fn record_ping(&self, peer_id: &str, at: DateTime<Utc>) -> Result<Node>;

    /// Create a network unless one with that name exists
    async fn create_network_if_absent(
        &self,
        name: &str,
        password: &str,
        network_type: &str,
    ) -> Result<(Network, bool)>;

    async fn network_by_name(&self, name: &str) -> Result<Option<Network>>;

    async fn list_networks(&self) -> Result<Vec<Network>>;

    /// Live members of a network with their nodes
    async fn network_members(&self, network_id: u64) -> Result<Vec<MemberEntry>>;

    /// Add a node to a network unless it already is a member
    async fn ensure_membership(
        &self,
        network_id: u64,
        node_id: u64,
        last_sync: DateTime<Utc>,
    ) -> Result<(NetworkMember, bool)>;

    /// Set the `last_sync` timestamp of a membership
    async fn touch_member(&self, member_id: u64, at: DateTime<Utc>) -> Result<()>;

    /// Memberships of a node, with the network name
    async fn memberships_of(&self, node_id: u64) -> Result<Vec<(String, NetworkMember)>>;

    /// Peer identities of every member of the named network
    async fn network_peer_ids(&self, network_name: &str) -> Result<HashSet<String>> {
        let Some(network) = self.network_by_name(network_name).await? else {
            return Ok(HashSet::new());
        };
        Ok(self
            .network_members(network.id)
            .await?
            .into_iter()
            .map(|entry| entry.node.peer_id)
            .collect())
    }
}
