//! Federation control endpoints
//!
//! Answered in-process for peers that reach this node over the request
//! bridge: network login, SyncGet, descriptor push and ping.

use async_trait::async_trait;
use libp2p::PeerId;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::SESSION_COOKIE;
use crate::bridge::{BridgeRequest, BridgeResponse, LocalService};
use crate::error::{FedError, Result};
use crate::federation::Federation;
use crate::sync::{accept_push, respond_sync_get, LoginRequest, SyncGetRequest, SyncPushRequest};

/// Prefix shared by every federation endpoint
pub const CONTROL_PREFIX: &str = "/api/v1/federation/";

pub const LOGIN_PATH: &str = "/api/v1/federation/networks/login";

const SYNC_PREFIX: &str = "/api/v1/federation/networks/sync/";
const NODES_PREFIX: &str = "/api/v1/federation/nodes/";

pub fn sync_get_path(network: &str) -> String {
    format!("{}{}/get", SYNC_PREFIX, network)
}

pub fn sync_push_path(network: &str) -> String {
    format!("{}{}/push", SYNC_PREFIX, network)
}

pub fn ping_path(peer_id: &str) -> String {
    format!("{}{}/ping", NODES_PREFIX, peer_id)
}

enum Route<'a> {
    Login,
    SyncGet(&'a str),
    SyncPush(&'a str),
    Ping(&'a str),
}

fn route(path: &str) -> Option<Route<'_>> {
    if path == LOGIN_PATH {
        return Some(Route::Login);
    }
    if let Some(rest) = path.strip_prefix(SYNC_PREFIX) {
        return match rest.rsplit_once('/') {
            Some((network, "get")) if !network.is_empty() => Some(Route::SyncGet(network)),
            Some((network, "push")) if !network.is_empty() => Some(Route::SyncPush(network)),
            _ => None,
        };
    }
    if let Some(rest) = path.strip_prefix(NODES_PREFIX) {
        return match rest.split_once('/') {
            Some((peer, "ping")) if !peer.is_empty() => Some(Route::Ping(peer)),
            _ => None,
        };
    }
    None
}

/// Whether `path` is answered by [`ControlService`]
pub fn is_control_path(path: &str) -> bool {
    route(path).is_some()
}

/// In-process handler of the control endpoints
pub struct ControlService {
    federation: Arc<Federation>,
}

impl ControlService {
    pub fn new(federation: Arc<Federation>) -> Self {
        Self { federation }
    }

    async fn login(&self, req: &BridgeRequest) -> Result<BridgeResponse> {
        let creds: LoginRequest = req.parse_json()?;
        if self.federation.supervisor().is_syncing(&creds.name) {
            return Err(FedError::Busy(format!("sync of {} in progress", creds.name)));
        }

        let token = self.federation.sessions().login(&creds.name, &creds.password)?;
        Ok(BridgeResponse::json(200, &json!({ "status": "ok" }))?.with_header(
            "Set-Cookie",
            format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token),
        ))
    }

    fn authorize(&self, req: &BridgeRequest, network: &str) -> Result<()> {
        let valid = req
            .cookie(SESSION_COOKIE)
            .is_some_and(|token| self.federation.sessions().validate(token, network));
        if valid {
            Ok(())
        } else {
            Err(FedError::Unauthorized(format!("no session for {}", network)))
        }
    }

    async fn sync_get(&self, peer: PeerId, req: &BridgeRequest, network: &str) -> Result<BridgeResponse> {
        self.authorize(req, network)?;
        let body: SyncGetRequest = req.parse_json()?;
        if body.requestor_info.peer_id != peer.to_string() {
            return Err(FedError::Rejected(format!(
                "{} sent a descriptor for {}",
                peer, body.requestor_info.peer_id
            )));
        }

        let resp = respond_sync_get(&self.federation, network, body).await?;
        BridgeResponse::json(200, &resp)
    }

    async fn sync_push(&self, req: &BridgeRequest, network: &str) -> Result<BridgeResponse> {
        self.authorize(req, network)?;
        let body: SyncPushRequest = req.parse_json()?;
        let resp = accept_push(&self.federation, network, body).await?;
        if resp.accepted > 0 {
            info!("Accepted {} pushed descriptors for {}", resp.accepted, network);
        }
        BridgeResponse::json(200, &resp)
    }

    async fn ping(&self, peer_id: &str) -> Result<BridgeResponse> {
        let node = self.federation.record_ping(peer_id).await?;
        BridgeResponse::json(200, &json!({ "latest_ping": node.latest_ping }))
    }
}

#[async_trait]
impl LocalService for ControlService {
    async fn handle(&self, peer: PeerId, req: BridgeRequest) -> Result<BridgeResponse> {
        if req.method != "POST" {
            return Ok(BridgeResponse::text(405, "method not allowed"));
        }

        let result = match route(req.route()) {
            Some(Route::Login) => self.login(&req).await,
            Some(Route::SyncGet(network)) => self.sync_get(peer, &req, network).await,
            Some(Route::SyncPush(network)) => self.sync_push(&req, network).await,
            Some(Route::Ping(peer_id)) => self.ping(peer_id).await,
            None => return Ok(BridgeResponse::text(404, "not found")),
        };

        Ok(result.unwrap_or_else(|e| {
            debug!("Control call {} from {} failed: {}", req.path, peer, e);
            BridgeResponse::json(e.status_code(), &json!({ "error": e.to_string() }))
                .unwrap_or_else(|_| BridgeResponse::text(e.status_code(), e.to_string()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert!(matches!(route(LOGIN_PATH), Some(Route::Login)));
        assert!(matches!(
            route(&sync_get_path("hive")),
            Some(Route::SyncGet("hive"))
        ));
        assert!(matches!(
            route(&sync_push_path("hive")),
            Some(Route::SyncPush("hive"))
        ));
        assert!(matches!(route(&ping_path("abc")), Some(Route::Ping("abc"))));
        assert!(route("/api/v1/federation/identity").is_none());
        assert!(route("/api/v1/federation/networks/sync//get").is_none());
        assert!(!is_control_path("/chat"));
    }
}
