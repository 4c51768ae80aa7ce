//! Messages exchanged during a sync pass and the responder's side of them

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::{FedError, Result};
use crate::federation::{Applied, Federation};
use crate::model::{Network, NodeSyncInfo};

/// Credentials of a network service account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

/// What the requestor knows, sent to a member it syncs with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncGetRequest {
    pub peer_ids: Vec<String>,
    pub requestor_info: NodeSyncInfo,
    #[serde(default)]
    pub peer_info_hashes: HashMap<String, String>,
}

/// What the responder knows that the requestor might not
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncGetResponse {
    pub peer_ids: Vec<String>,
    pub missing_nodes: Vec<NodeSyncInfo>,
    #[serde(default)]
    pub different_nodes: Vec<NodeSyncInfo>,
}

/// Descriptors handed to a member that did not list them
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncPushRequest {
    pub nodes: Vec<NodeSyncInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPushResponse {
    pub accepted: usize,
}

async fn load_network(federation: &Federation, name: &str) -> Result<Network> {
    federation
        .registry()
        .network_by_name(name)
        .await?
        .ok_or_else(|| FedError::NetworkNotFound(name.to_string()))
}

/// Answer a SyncGet for `network_name`.
///
/// `peer_ids` is computed before the requestor is registered, and the
/// requestor's own descriptor is never sent back to it.
pub async fn respond_sync_get(
    federation: &Federation,
    network_name: &str,
    req: SyncGetRequest,
) -> Result<SyncGetResponse> {
    let network = load_network(federation, network_name).await?;
    let members = federation.registry().network_members(network.id).await?;

    let requested: HashSet<&str> = req.peer_ids.iter().map(String::as_str).collect();
    let requestor = req.requestor_info.peer_id.clone();
    let mut resp = SyncGetResponse::default();

    for entry in &members {
        let peer = entry.node.peer_id.as_str();
        resp.peer_ids.push(peer.to_string());
        if peer == requestor.as_str() {
            continue;
        }

        if !requested.contains(peer) {
            resp.missing_nodes.push(entry.node.sync_info());
        } else if let Some(hash) = req.peer_info_hashes.get(peer) {
            if *hash != entry.node.info_hash() {
                resp.different_nodes.push(entry.node.sync_info());
            }
        }
    }

    let known = members.iter().any(|e| e.node.peer_id == requestor);
    if !known {
        match federation.apply_descriptor(&network, req.requestor_info).await {
            Ok(_) => debug!("Registered requestor {} in {}", requestor, network_name),
            Err(e) => warn!("Could not register requestor {}: {}", requestor, e),
        }
    }

    debug!(
        "SyncGet for {}: {} known, {} missing, {} different",
        network_name,
        resp.peer_ids.len(),
        resp.missing_nodes.len(),
        resp.different_nodes.len()
    );
    Ok(resp)
}

/// Apply descriptors pushed by a member. Descriptors that fail to apply
/// are skipped.
pub async fn accept_push(
    federation: &Federation,
    network_name: &str,
    req: SyncPushRequest,
) -> Result<SyncPushResponse> {
    let network = load_network(federation, network_name).await?;
    let mut accepted = 0;

    for info in req.nodes {
        let peer = info.peer_id.clone();
        match federation.apply_descriptor(&network, info).await {
            Ok(Applied::Created) | Ok(Applied::Updated) => accepted += 1,
            Ok(Applied::Unchanged) => {}
            Err(e) => warn!("Skipping pushed descriptor {}: {}", peer, e),
        }
    }
    Ok(SyncPushResponse { accepted })
}
