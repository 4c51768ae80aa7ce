//! Running proxy lanes

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::descriptor::{Direction, ProxyDescriptor, ProxyKind, ProxySpec};
use super::http::HttpEgress;
use crate::bridge::{IncomingRequestHandler, LoopbackService};
use crate::error::{FedError, Result};
use crate::federation::Federation;
use crate::tls::load_server_config;
use crate::tunnel::{ProxyStats, StatsSnapshot, TunnelIngress, TunnelListener};

/// A lane as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct LaneInfo {
    #[serde(flatten)]
    pub spec: ProxySpec,
    pub protocol: String,
    pub local_addr: Option<String>,
    pub stats: StatsSnapshot,
}

struct RunningLane {
    descriptor: ProxyDescriptor,
    protocol: String,
    local_addr: Option<String>,
    stats: Arc<ProxyStats>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningLane {
    fn info(&self) -> LaneInfo {
        LaneInfo {
            spec: ProxySpec::from(&self.descriptor),
            protocol: self.protocol.clone(),
            local_addr: self.local_addr.clone(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Starts, lists and stops proxy lanes
pub struct ProxyManager {
    federation: Arc<Federation>,
    lanes: Arc<Mutex<HashMap<String, RunningLane>>>,
}

impl ProxyManager {
    pub fn new(federation: Arc<Federation>) -> Self {
        Self {
            federation,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start every active lane, logging the ones that fail
    pub async fn start_all(&self, descriptors: Vec<ProxyDescriptor>) -> usize {
        let mut started = 0;
        for desc in descriptors {
            if !desc.active {
                info!("Skipping inactive lane {}", desc.id);
                continue;
            }
            let id = desc.id.clone();
            match self.start(desc).await {
                Ok(_) => started += 1,
                Err(e) => warn!("Failed to start lane {}: {}", id, e),
            }
        }
        started
    }

    /// Start one lane
    pub async fn start(&self, desc: ProxyDescriptor) -> Result<LaneInfo> {
        if self.lanes.lock().contains_key(&desc.id) {
            return Err(FedError::InvalidProxy(format!("lane {} already running", desc.id)));
        }
        if desc.is_expired() {
            return Err(FedError::InvalidProxy(format!("lane {} has expired", desc.id)));
        }

        let protocol = desc.protocol(&self.federation.local_peer_id())?;
        let shutdown;
        let stats;
        let local_addr;
        let task;

        match (&desc.direction, desc.kind) {
            (Direction::Egress { target_peer }, ProxyKind::Tcp | ProxyKind::Ssh) => {
                let tls = match &desc.tls {
                    Some(files) => Some(load_server_config(&files.cert, &files.key)?),
                    None => None,
                };
                let listener = TunnelListener::bind(
                    &format!("127.0.0.1:{}", desc.port),
                    Arc::clone(self.federation.transport()),
                    *target_peer,
                    protocol.clone(),
                    tls,
                )
                .await?;
                shutdown = listener.closer();
                stats = listener.stats();
                local_addr = Some(listener.local_addr().to_string());
                task = tokio::spawn(listener.run());
            }
            (Direction::Egress { target_peer }, ProxyKind::Http) => {
                let egress = HttpEgress::bind(
                    &format!("127.0.0.1:{}", desc.port),
                    Arc::clone(&self.federation),
                    *target_peer,
                    protocol.clone(),
                )
                .await?;
                shutdown = egress.closer();
                stats = egress.stats();
                local_addr = Some(egress.local_addr().to_string());
                task = tokio::spawn(egress.run());
            }
            (Direction::Ingress { target }, ProxyKind::Tcp | ProxyKind::Ssh) => {
                let incoming = self.federation.transport().accept(protocol.clone())?;
                let ingress = Arc::new(
                    TunnelIngress::new(target.clone(), Arc::clone(self.federation.registry()))
                        .restrict_to_network(desc.network.clone()),
                );
                shutdown = CancellationToken::new();
                stats = ingress.stats();
                local_addr = None;
                task = tokio::spawn(ingress.serve(incoming, shutdown.clone()));
            }
            (Direction::Ingress { target }, ProxyKind::Http) => {
                let incoming = self.federation.transport().accept(protocol.clone())?;
                let service = LoopbackService::new(
                    &format!("http://{}", target),
                    self.federation.bridge().timeout(),
                )?;
                let handler = Arc::new(
                    IncomingRequestHandler::new(
                        Arc::new(service),
                        Arc::clone(self.federation.registry()),
                    )
                    .restrict_to_network(desc.network.clone()),
                );
                shutdown = CancellationToken::new();
                stats = ProxyStats::new();
                local_addr = None;
                let token = shutdown.clone();
                task = tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = handler.serve(incoming) => {}
                    }
                });
            }
        }

        if let Some(expires_at) = desc.expires_at {
            self.schedule_expiry(desc.id.clone(), expires_at, shutdown.clone());
        }

        let lane = RunningLane {
            descriptor: desc,
            protocol: protocol.to_string(),
            local_addr,
            stats,
            shutdown,
            task,
        };
        let info = lane.info();
        {
            let mut lanes = self.lanes.lock();
            if lanes.contains_key(&lane.descriptor.id) {
                // lost a race with a concurrent start of the same id
                lane.shutdown.cancel();
                lane.task.abort();
                return Err(FedError::InvalidProxy(format!(
                    "lane {} already running",
                    lane.descriptor.id
                )));
            }
            lanes.insert(lane.descriptor.id.clone(), lane);
        }
        info!("Lane {} started on {}", info.spec.id.as_deref().unwrap_or(""), info.protocol);
        Ok(info)
    }

    fn schedule_expiry(&self, id: String, expires_at: chrono::DateTime<Utc>, token: CancellationToken) {
        let lanes = Arc::clone(&self.lanes);
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {
                    info!("Lane {} expired", id);
                    token.cancel();
                    lanes.lock().remove(&id);
                }
            }
        });
    }

    /// Stop a lane and wait for it to drain. Returns false if unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(lane) = self.lanes.lock().remove(id) else {
            return false;
        };
        lane.shutdown.cancel();
        if let Err(e) = lane.task.await {
            warn!("Lane {} ended abnormally: {}", id, e);
        }
        info!("Lane {} stopped", id);
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.lanes.lock().keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Running lanes, ordered by id
    pub fn list(&self) -> Vec<LaneInfo> {
        let mut lanes: Vec<LaneInfo> = self.lanes.lock().values().map(RunningLane::info).collect();
        lanes.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        lanes
    }
}
