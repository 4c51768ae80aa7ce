//! Registry records and the descriptors nodes exchange about each other

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A known node of the overlay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    #[serde(skip)]
    pub id: u64,
    pub uuid: Uuid,
    pub node_name: String,
    pub peer_id: String,
    pub addresses: Vec<NodeAddressRecord>,
    pub last_changed: DateTime<Utc>,
    pub latest_ping: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Plain address strings, in stored order
    pub fn address_strings(&self) -> Vec<String> {
        self.addresses.iter().map(|a| a.address.clone()).collect()
    }

    /// Descriptor handed to other nodes during sync
    pub fn sync_info(&self) -> NodeSyncInfo {
        NodeSyncInfo {
            name: self.node_name.clone(),
            peer_id: self.peer_id.clone(),
            addresses: sorted(self.address_strings()),
            last_updated: self.last_changed,
        }
    }

    /// Hash of the canonical descriptor, used to spot diverging copies
    pub fn info_hash(&self) -> String {
        NodeRepresentation {
            name: self.node_name.clone(),
            peer_id: self.peer_id.clone(),
            addresses: sorted(self.address_strings()),
        }
        .hash()
    }
}

/// One stored address row of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddressRecord {
    #[serde(skip)]
    pub id: u64,
    pub address: String,
}

/// A named, password protected group of nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    #[serde(skip)]
    pub id: u64,
    pub network_name: String,
    pub network_type: String,
    #[serde(skip_serializing)]
    pub network_password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Accepted,
    Pending,
}

/// Association between a network and a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkMember {
    #[serde(skip)]
    pub id: u64,
    #[serde(skip)]
    pub network_id: u64,
    #[serde(skip)]
    pub node_id: u64,
    pub last_sync: DateTime<Utc>,
    pub status: MemberStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A member row together with its node
#[derive(Debug, Clone)]
pub struct MemberEntry {
    pub member: NetworkMember,
    pub node: Node,
}

/// Registration payload, accepted from operators and from peers during sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterNode {
    pub name: String,
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_to_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
}

impl RegisterNode {
    pub fn new(name: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            addresses,
            add_to_network: None,
            last_changed: None,
        }
    }

    pub fn in_network(mut self, network: impl Into<String>) -> Self {
        self.add_to_network = Some(network.into());
        self
    }
}

/// Node descriptor exchanged between members of a network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSyncInfo {
    pub name: String,
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl NodeSyncInfo {
    pub fn into_registration(self, network: &str) -> RegisterNode {
        RegisterNode {
            name: self.name,
            addresses: self.addresses,
            add_to_network: Some(network.to_string()),
            last_changed: Some(self.last_updated),
        }
    }
}

/// Canonical, timestamp free form of a node descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRepresentation {
    pub name: String,
    pub peer_id: String,
    pub addresses: Vec<String>,
}

impl NodeRepresentation {
    pub fn hash(&self) -> String {
        // serialization of plain strings cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }
}

fn sorted(mut addresses: Vec<String>) -> Vec<String> {
    addresses.sort();
    addresses
}
