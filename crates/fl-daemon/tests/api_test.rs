//! Admin API served on an ephemeral port over in-process nodes

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use fl_core::network::Transport;
use fl_core::{
    is_control_path, AllowList, BridgeRequest, BridgeResponse, ControlService, Federation,
    IncomingRequestHandler, LocalService, MemoryHub, MemoryRegistry, NetworkSyncer, PeerId,
    ProxyManager, RoutedService, REQUEST_PROTOCOL,
};
use fl_daemon::{router, ApiState};

const TOKEN: &str = "s3cret";

/// Answers every non-control path with the method and path it saw
struct WhoAmI;

#[async_trait]
impl LocalService for WhoAmI {
    async fn handle(&self, peer: PeerId, req: BridgeRequest) -> fl_core::Result<BridgeResponse> {
        Ok(BridgeResponse::text(
            200,
            format!("{} {} from {}", req.method, req.path, peer),
        ))
    }
}

fn node(hub: &MemoryHub, name: &str) -> (PeerId, Arc<Federation>) {
    let peer = PeerId::random();
    let transport = hub.join(peer, None);
    let registry = Arc::new(MemoryRegistry::new());
    let federation = Federation::new(
        name,
        Arc::new(transport.clone()),
        registry.clone(),
        AllowList::new(),
        Duration::from_secs(5),
    );
    let service = RoutedService::new(
        Arc::new(ControlService::new(Arc::clone(&federation))),
        is_control_path,
        Some(Arc::new(WhoAmI)),
    );
    let handler = Arc::new(IncomingRequestHandler::new(Arc::new(service), registry));
    tokio::spawn(handler.serve(transport.accept(REQUEST_PROTOCOL).unwrap()));
    (peer, federation)
}

struct Harness {
    base: String,
    client: reqwest::Client,
    remote: Arc<Federation>,
    remote_peer: PeerId,
}

impl Harness {
    async fn start() -> Self {
        let hub = MemoryHub::new();
        let (local_peer, local) = node(&hub, "alpha");
        let (remote_peer, remote) = node(&hub, "bravo");
        hub.link(&local_peer, &remote_peer);
        local.ensure_own_node().await.unwrap();
        remote.ensure_own_node().await.unwrap();

        let state = Arc::new(ApiState {
            syncer: Arc::new(NetworkSyncer::new(
                Arc::clone(&local),
                Duration::from_secs(60),
            )),
            proxies: Arc::new(ProxyManager::new(Arc::clone(&local))),
            federation: local,
            admin_token: Some(TOKEN.to_string()),
            sync_interval: Duration::from_secs(3600),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            remote,
            remote_peer,
        }
    }

    async fn call(&self, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap();
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .bearer_auth(TOKEN);
        if let Some(body) = body {
            req = req
                .header("content-type", "application/json")
                .body(body.to_string());
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        (status, serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn register_remote(&self) -> Value {
        let body = json!({
            "name": "bravo",
            "addresses": self.remote.connect_addresses(),
        });
        let (status, node) = self
            .call("POST", "/api/v1/federation/nodes/register", Some(body))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        node
    }
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let h = Harness::start().await;

    let resp = h
        .client
        .get(format!("{}/api/v1/federation/identity", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .client
        .get(format!("{}/api/v1/federation/identity", h.base))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let (status, identity) = h.call("GET", "/api/v1/federation/identity", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(identity["id"].is_string());
}

#[tokio::test]
async fn test_register_then_list_pages() {
    let h = Harness::start().await;
    let node = h.register_remote().await;
    assert_eq!(node["peer_id"], h.remote_peer.to_string());

    let (status, page) = h.call("GET", "/api/v1/federation/nodes/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["page"], 1);
    assert_eq!(page["limit"], 10);
    assert_eq!(page["total_rows"], 2);
    assert_eq!(page["total_pages"], 1);
    let names: Vec<&str> = page["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["node_name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"bravo"));

    let (status, page) = h
        .call("GET", "/api/v1/federation/nodes/list?page=2&limit=1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["rows"].as_array().unwrap().len(), 1);
    assert_eq!(page["total_pages"], 2);

    let (status, _) = h
        .call("GET", "/api/v1/federation/nodes/list?page=9", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_node_goes_over_the_bridge() {
    let h = Harness::start().await;
    let node = h.register_remote().await;
    let uuid = node["uuid"].as_str().unwrap();

    let resp = h
        .client
        .post(format!("{}/api/v1/federation/nodes/{}/request", h.base, uuid))
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body(json!({ "method": "GET", "path": "/hello?x=1" }).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert!(text.starts_with("GET /hello?x=1 from "));

    let (status, _) = h
        .call(
            "POST",
            "/api/v1/federation/nodes/00000000-0000-0000-0000-000000000000/request",
            Some(json!({ "method": "GET", "path": "/" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ping_needs_no_token() {
    let h = Harness::start().await;
    h.register_remote().await;

    let resp = h
        .client
        .post(format!(
            "{}/api/v1/federation/nodes/{}/ping",
            h.base, h.remote_peer
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h
        .client
        .post(format!(
            "{}/api/v1/federation/nodes/{}/ping",
            h.base,
            PeerId::random()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_network_starts_sync() {
    let h = Harness::start().await;
    let body = json!({ "name": "lab", "password": "pw" });

    let (status, created) = h
        .call("POST", "/api/v1/federation/networks/create", Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["created"], true);

    let (status, again) = h
        .call("POST", "/api/v1/federation/networks/create", Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);

    let (_, syncing) = h.call("GET", "/api/v1/federation/networks/syncing", None).await;
    assert_eq!(syncing, json!(["lab"]));

    // sync-get without admin token or session cookie
    let resp = h
        .client
        .post(format!(
            "{}/api/v1/federation/networks/sync/lab/get",
            h.base
        ))
        .header("content-type", "application/json")
        .body(
            json!({
                "peer_ids": [],
                "requestor_info": {
                    "name": "bravo",
                    "peer_id": h.remote_peer.to_string(),
                    "addresses": h.remote.connect_addresses(),
                    "last_updated": "2026-01-01T00:00:00Z",
                },
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_whitelist_follows_registry() {
    let h = Harness::start().await;
    let (_, peers) = h.call("GET", "/api/v1/federation/whitelisted-peers", None).await;
    assert_eq!(peers, json!([]));

    h.register_remote().await;
    let (status, refreshed) = h
        .call("POST", "/api/v1/federation/whitelist/refresh", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(refreshed["peers"].as_u64().unwrap() >= 1);

    let (_, peers) = h.call("GET", "/api/v1/federation/whitelisted-peers", None).await;
    assert!(peers
        .as_array()
        .unwrap()
        .contains(&json!(h.remote_peer.to_string())));
}

#[tokio::test]
async fn test_proxy_endpoints() {
    let h = Harness::start().await;
    let (status, lanes) = h.call("GET", "/api/v1/proxies", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lanes, json!([]));

    let spec = json!({
        "id": "web",
        "port": 0,
        "kind": "tcp",
        "direction": "ingress",
        "target": "127.0.0.1:9",
    });
    let (status, lane) = h.call("POST", "/api/v1/proxies", Some(spec.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(lane["id"], "web");

    let (status, _) = h.call("POST", "/api/v1/proxies", Some(spec)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.call("DELETE", "/api/v1/proxies/web", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = h.call("DELETE", "/api/v1/proxies/web", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let h = Harness::start().await;

    // missing field
    let (status, body) = h
        .call(
            "POST",
            "/api/v1/federation/networks/create",
            Some(json!({ "name": "lab" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("password"));

    // broken syntax
    let resp = h
        .client
        .post(format!("{}/api/v1/federation/nodes/register", h.base))
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body("{\"name\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // no content type
    let resp = h
        .client
        .post(format!("{}/api/v1/proxies", h.base))
        .bearer_auth(TOKEN)
        .body(json!({ "port": 0 }).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert!(body["error"].is_string());
}
