//! One anti-entropy pass over a network
//!
//! Members are visited one at a time. A member that fails is logged and
//! skipped; the rest of the pass continues.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::exchange::{LoginRequest, SyncGetRequest, SyncGetResponse, SyncPushRequest};
use super::supervisor::SyncPass;
use crate::auth::{session_from_set_cookie, SESSION_COOKIE};
use crate::bridge::{BridgeRequest, BridgeResponse};
use crate::control::{sync_get_path, sync_push_path, LOGIN_PATH};
use crate::error::{FedError, Result};
use crate::federation::{Applied, Federation};
use crate::model::{MemberEntry, Network, Node};
use crate::network::REQUEST_PROTOCOL;

/// Counters of one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassReport {
    /// Stale members contacted
    pub attempted: usize,
    pub synced: usize,
    /// Members that answered busy and were deferred
    pub busy: usize,
    pub failed: usize,
    /// Nodes learned from members
    pub learned: usize,
    /// Nodes updated from newer descriptors
    pub updated: usize,
    /// Descriptors pushed to members
    pub pushed: usize,
}

enum MemberOutcome {
    Busy,
    Synced {
        learned: usize,
        updated: usize,
        pushed: usize,
    },
}

/// Runs sync passes for the networks of one node
pub struct NetworkSyncer {
    federation: Arc<Federation>,
    staleness: Duration,
}

impl NetworkSyncer {
    pub fn new(federation: Arc<Federation>, staleness: Duration) -> Self {
        Self {
            federation,
            staleness,
        }
    }

    /// Sync every stale member of `network_name` other than this node
    pub async fn sync_network(&self, network_name: &str) -> Result<PassReport> {
        let registry = self.federation.registry();
        let network = registry
            .network_by_name(network_name)
            .await?
            .ok_or_else(|| FedError::NetworkNotFound(network_name.to_string()))?;
        let own = self.federation.ensure_own_node().await?;

        let staleness = ChronoDuration::from_std(self.staleness)
            .map_err(|e| FedError::ConfigError(e.to_string()))?;
        let cutoff = Utc::now() - staleness;

        let stale: Vec<MemberEntry> = registry
            .network_members(network.id)
            .await?
            .into_iter()
            .filter(|e| e.node.peer_id != own.peer_id && e.member.last_sync < cutoff)
            .collect();

        let mut report = PassReport::default();
        for entry in stale {
            report.attempted += 1;
            match self.sync_member(&network, &entry, &own).await {
                Ok(MemberOutcome::Busy) => {
                    info!(
                        "{} is busy syncing {}, deferring",
                        entry.node.peer_id, network_name
                    );
                    report.busy += 1;
                }
                Ok(MemberOutcome::Synced {
                    learned,
                    updated,
                    pushed,
                }) => {
                    report.synced += 1;
                    report.learned += learned;
                    report.updated += updated;
                    report.pushed += pushed;
                    if let Err(e) = registry.touch_member(entry.member.id, Utc::now()).await {
                        warn!("Could not record sync with {}: {}", entry.node.peer_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Sync of {} with {} failed: {}",
                        network_name, entry.node.peer_id, e
                    );
                    report.failed += 1;
                }
            }
        }

        info!("Sync pass for {}: {:?}", network_name, report);
        Ok(report)
    }

    async fn sync_member(
        &self,
        network: &Network,
        entry: &MemberEntry,
        own: &Node,
    ) -> Result<MemberOutcome> {
        let peer = &entry.node;
        let bridge = self.federation.bridge();

        let login = BridgeRequest::post_json(
            LOGIN_PATH,
            &LoginRequest {
                name: network.network_name.clone(),
                password: network.network_password.clone(),
            },
        )?;
        let resp = bridge.send(peer, REQUEST_PROTOCOL, &login).await?;
        if resp.status == 429 {
            return Ok(MemberOutcome::Busy);
        }
        let resp = expect_success(resp, "login")?;
        let token = resp
            .header("set-cookie")
            .and_then(session_from_set_cookie)
            .ok_or_else(|| FedError::MalformedResponse("login returned no session".to_string()))?
            .to_string();
        let cookie = format!("{}={}", SESSION_COOKIE, token);

        // Re-read membership: earlier members of this pass may have taught us nodes
        let known = self
            .federation
            .registry()
            .network_members(network.id)
            .await?;
        let request = SyncGetRequest {
            peer_ids: known.iter().map(|e| e.node.peer_id.clone()).collect(),
            requestor_info: own.sync_info(),
            peer_info_hashes: known
                .iter()
                .map(|e| (e.node.peer_id.clone(), e.node.info_hash()))
                .collect(),
        };
        let get = BridgeRequest::post_json(sync_get_path(&network.network_name), &request)?
            .with_header("Cookie", cookie.clone());
        let resp = expect_success(bridge.send(peer, REQUEST_PROTOCOL, &get).await?, "sync-get")?;
        let answer: SyncGetResponse = resp.parse_json()?;

        let mut learned = 0;
        for info in answer.missing_nodes {
            let id = info.peer_id.clone();
            match self.federation.apply_descriptor(network, info).await {
                Ok(Applied::Created) => learned += 1,
                Ok(_) => {}
                Err(e) => warn!("Ignoring descriptor {} from {}: {}", id, peer.peer_id, e),
            }
        }

        let mut updated = 0;
        for info in answer.different_nodes {
            let id = info.peer_id.clone();
            match self.federation.apply_descriptor(network, info).await {
                Ok(Applied::Updated) => updated += 1,
                Ok(_) => {}
                Err(e) => warn!("Ignoring descriptor {} from {}: {}", id, peer.peer_id, e),
            }
        }

        let remote: HashSet<String> = answer.peer_ids.into_iter().collect();
        let nodes: Vec<_> = self
            .federation
            .registry()
            .network_members(network.id)
            .await?
            .into_iter()
            .filter(|e| e.node.peer_id != peer.peer_id && !remote.contains(&e.node.peer_id))
            .map(|e| e.node.sync_info())
            .collect();

        let pushed = nodes.len();
        if pushed > 0 {
            let push = BridgeRequest::post_json(
                sync_push_path(&network.network_name),
                &SyncPushRequest { nodes },
            )?
            .with_header("Cookie", cookie);
            expect_success(bridge.send(peer, REQUEST_PROTOCOL, &push).await?, "sync-push")?;
            debug!("Pushed {} descriptors to {}", pushed, peer.peer_id);
        }

        Ok(MemberOutcome::Synced {
            learned,
            updated,
            pushed,
        })
    }
}

fn expect_success(resp: BridgeResponse, step: &str) -> Result<BridgeResponse> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(resp),
        401 | 403 => Err(FedError::Unauthorized(format!("{} refused ({})", step, resp.status))),
        s => Err(FedError::MalformedResponse(format!("{} answered {}", step, s))),
    }
}

#[async_trait]
impl SyncPass for NetworkSyncer {
    async fn run_pass(&self, network: &str) -> Result<PassReport> {
        self.sync_network(network).await
    }
}
