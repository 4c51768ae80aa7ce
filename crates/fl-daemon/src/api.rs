//! Admin HTTP API
//!
//! | Endpoint | Method | Auth |
//! |----------|--------|------|
//! | `/api/v1/federation/identity` | GET | admin |
//! | `/api/v1/federation/nodes/register` | POST | admin |
//! | `/api/v1/federation/nodes/list` | GET | admin |
//! | `/api/v1/federation/nodes/:id/request` | POST | admin |
//! | `/api/v1/federation/nodes/:id/ping` | POST | none |
//! | `/api/v1/federation/networks/create` | POST | admin |
//! | `/api/v1/federation/networks/sync/:network/get` | POST | admin or network session |
//! | `/api/v1/federation/networks/syncing` | GET | admin |
//! | `/api/v1/federation/whitelisted-peers` | GET | admin |
//! | `/api/v1/federation/whitelist/refresh` | POST | admin |
//! | `/api/v1/proxies` | GET, POST | admin |
//! | `/api/v1/proxies/:id` | DELETE | admin |

use axum::{
    body::Body,
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fl_core::auth::SESSION_COOKIE;
use fl_core::model::NodeAddressRecord;
use fl_core::sync::{respond_sync_get, SyncGetRequest, SyncPass};
use fl_core::{
    BridgeRequest, FedError, Federation, NetworkSyncer, ProxyDescriptor, ProxyManager, ProxySpec,
    RegisterNode, Registry, REQUEST_PROTOCOL,
};

const DEFAULT_PAGE: usize = 1;
const DEFAULT_LIMIT: usize = 10;

/// Everything the handlers need
pub struct ApiState {
    pub federation: Arc<Federation>,
    pub syncer: Arc<NetworkSyncer>,
    pub proxies: Arc<ProxyManager>,
    pub admin_token: Option<String>,
    pub sync_interval: Duration,
}

pub type SharedState = Arc<ApiState>;

impl ApiState {
    fn is_admin(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.admin_token else {
            return false;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }

    fn has_session(&self, headers: &HeaderMap, network: &str) -> bool {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, token)| {
                name == SESSION_COOKIE && self.federation.sessions().validate(token, network)
            })
    }

    /// Create (or reuse) a network and make sure its sync task runs
    pub async fn bootstrap_network(&self, name: &str, password: &str) -> fl_core::Result<bool> {
        let (_, created) = self.federation.create_network(name, password).await?;
        let pass: Arc<dyn SyncPass> = self.syncer.clone();
        if self
            .federation
            .supervisor()
            .start(name, pass, self.sync_interval)
        {
            info!("Sync of {} started", name);
        }
        Ok(created)
    }
}

/// A [`FedError`] rendered as a JSON error body
pub struct ApiError(FedError);

impl From<FedError> for ApiError {
    fn from(err: FedError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("API error: {}", self.0);
        } else {
            debug!("API error: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// `Json` whose rejections (bad syntax, missing fields, wrong content type)
/// answer 400 with the usual error body
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(FedError::MalformedRequest(rejection.body_text()).into()),
        }
    }
}

pub fn router(state: SharedState) -> Router {
    let admin = Router::new()
        .route("/api/v1/federation/identity", get(identity))
        .route("/api/v1/federation/nodes/register", post(register_node))
        .route("/api/v1/federation/nodes/list", get(list_nodes))
        .route("/api/v1/federation/nodes/:id/request", post(request_node))
        .route("/api/v1/federation/networks/create", post(create_network))
        .route("/api/v1/federation/networks/syncing", get(syncing_networks))
        .route("/api/v1/federation/whitelisted-peers", get(whitelisted_peers))
        .route("/api/v1/federation/whitelist/refresh", post(refresh_whitelist))
        .route("/api/v1/proxies", get(list_proxies).post(start_proxy))
        .route("/api/v1/proxies/:id", delete(stop_proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/api/v1/federation/nodes/:id/ping", post(ping))
        .route("/api/v1/federation/networks/sync/:network/get", post(sync_get))
        .merge(admin)
        .with_state(state)
}

async fn require_admin(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if state.is_admin(req.headers()) {
        next.run(req).await
    } else {
        ApiError(FedError::Unauthorized("admin token required".to_string())).into_response()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODES
// ════════════════════════════════════════════════════════════════════════════

async fn identity(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.federation.identity())
}

async fn register_node(
    State(state): State<SharedState>,
    JsonBody(body): JsonBody<RegisterNode>,
) -> ApiResult<impl IntoResponse> {
    let node = state.federation.register_node(body).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    page: Option<String>,
    limit: Option<String>,
}

fn positive(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Serialize)]
pub struct MembershipRow {
    pub network_name: String,
    pub last_sync: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NodeRow {
    pub uuid: Uuid,
    pub node_name: String,
    pub peer_id: String,
    pub addresses: Vec<NodeAddressRecord>,
    pub network_memberships: Vec<MembershipRow>,
    pub latest_contact: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct NodePage {
    pub page: usize,
    pub limit: usize,
    pub total_rows: usize,
    pub total_pages: usize,
    pub rows: Vec<NodeRow>,
}

async fn list_nodes(
    State(state): State<SharedState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Response> {
    let page = positive(query.page.as_deref(), DEFAULT_PAGE);
    let limit = positive(query.limit.as_deref(), DEFAULT_LIMIT);

    let registry = state.federation.registry();
    let (nodes, total_rows) = registry.list_nodes_page(page, limit).await?;
    if nodes.is_empty() && page > 1 {
        return Ok((StatusCode::NOT_FOUND, Json(json!({ "error": "page not found" }))).into_response());
    }

    let mut rows = Vec::with_capacity(nodes.len());
    for node in nodes {
        let memberships = registry.memberships_of(node.id).await?;
        let latest_contact = memberships.iter().map(|(_, m)| m.last_sync).max();
        rows.push(NodeRow {
            uuid: node.uuid,
            node_name: node.node_name,
            peer_id: node.peer_id,
            addresses: node.addresses,
            network_memberships: memberships
                .into_iter()
                .map(|(network_name, m)| MembershipRow {
                    network_name,
                    last_sync: m.last_sync,
                })
                .collect(),
            latest_contact,
        });
    }

    Ok(Json(NodePage {
        page,
        limit,
        total_rows,
        total_pages: total_rows.div_ceil(limit),
        rows,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct NodeRequestBody {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

async fn request_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<NodeRequestBody>,
) -> ApiResult<Response> {
    let uuid = Uuid::parse_str(&id)
        .map_err(|e| FedError::MalformedRequest(format!("node id {}: {}", id, e)))?;
    let node = state
        .federation
        .registry()
        .node_by_uuid(uuid)
        .await?
        .ok_or_else(|| FedError::NodeNotFound(id.clone()))?;

    let mut req = BridgeRequest::new(body.method, body.path).with_body(body.body.into_bytes());
    for (name, value) in body.headers {
        req = req.with_header(name, value);
    }
    let resp = state
        .federation
        .bridge()
        .send(&node, REQUEST_PROTOCOL, &req)
        .await?;

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = resp.header("content-type") {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(resp.body))
        .map_err(|e| ApiError(FedError::MalformedResponse(e.to_string())))
}

async fn ping(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let node = state.federation.record_ping(&id).await?;
    Ok(Json(json!({ "peer_id": node.peer_id, "latest_ping": node.latest_ping })))
}

async fn whitelisted_peers(State(state): State<SharedState>) -> impl IntoResponse {
    let peers: Vec<String> = state
        .federation
        .gate()
        .snapshot()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(peers)
}

async fn refresh_whitelist(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let peers = state.federation.refresh_gate().await?;
    Ok(Json(json!({ "peers": peers })))
}

// ════════════════════════════════════════════════════════════════════════════
// NETWORKS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct CreateNetworkBody {
    pub name: String,
    pub password: String,
}

async fn create_network(
    State(state): State<SharedState>,
    JsonBody(body): JsonBody<CreateNetworkBody>,
) -> ApiResult<impl IntoResponse> {
    let created = state.bootstrap_network(&body.name, &body.password).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(json!({ "network_name": body.name, "created": created })),
    ))
}

async fn sync_get(
    State(state): State<SharedState>,
    Path(network): Path<String>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<SyncGetRequest>,
) -> ApiResult<impl IntoResponse> {
    if !state.is_admin(&headers) && !state.has_session(&headers, &network) {
        return Err(FedError::Unauthorized(format!("no session for {}", network)).into());
    }
    let resp = respond_sync_get(&state.federation, &network, body).await?;
    Ok(Json(resp))
}

async fn syncing_networks(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.federation.supervisor().active_networks())
}

// ════════════════════════════════════════════════════════════════════════════
// PROXIES
// ════════════════════════════════════════════════════════════════════════════

async fn list_proxies(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.proxies.list())
}

async fn start_proxy(
    State(state): State<SharedState>,
    JsonBody(spec): JsonBody<ProxySpec>,
) -> ApiResult<impl IntoResponse> {
    let desc = ProxyDescriptor::try_from(spec)?;
    let info = state.proxies.start(desc).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn stop_proxy(State(state): State<SharedState>, Path(id): Path<String>) -> StatusCode {
    if state.proxies.stop(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
