//! Proxy lane descriptors
//!
//! `ProxySpec` is the flat shape found in config files and API bodies;
//! `ProxyDescriptor` is the validated form a lane is started from.

use chrono::{DateTime, Utc};
use libp2p::{PeerId, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::address::parse_peer_id;
use crate::error::{FedError, Result};
use crate::network::{tunnel_protocol_for, REQUEST_PROTOCOL, TUNNEL_PROTOCOL};

/// What a lane carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Http,
    Ssh,
}

/// Which end of the lane this node is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LaneSide {
    Ingress,
    Egress,
}

fn default_active() -> bool {
    true
}

/// Unvalidated lane description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Local listening port of an egress lane
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_active")]
    pub active: bool,
    pub kind: ProxyKind,
    pub direction: LaneSide,
    /// Peer identity for egress, `host:port` for ingress
    pub target: String,
    /// Only members of this network may use an ingress lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Origin peer of an ingress lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    /// Port of the service on the other end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Certificate and key offered to local clients of an egress lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Streams from peers are forwarded to `target` on this host
    Ingress { target: String },
    /// Local connections are forwarded to `target_peer`
    Egress { target_peer: PeerId },
}

/// A validated proxy lane
#[derive(Debug, Clone)]
pub struct ProxyDescriptor {
    pub id: String,
    pub port: u16,
    pub active: bool,
    pub tls: Option<TlsFiles>,
    pub kind: ProxyKind,
    pub direction: Direction,
    pub network: Option<String>,
    pub peer: Option<PeerId>,
    pub remote_port: Option<u16>,
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn target_port(target: &str) -> Result<u16> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| FedError::InvalidProxy(format!("target {} has no port", target)))?;
    if host.is_empty() {
        return Err(FedError::InvalidProxy(format!("target {} has no host", target)));
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(FedError::InvalidProxy(format!("target {} has a bad port", target))),
    }
}

impl TryFrom<ProxySpec> for ProxyDescriptor {
    type Error = FedError;

    fn try_from(spec: ProxySpec) -> Result<Self> {
        if spec.target.trim().is_empty() {
            return Err(FedError::InvalidProxy("target is empty".to_string()));
        }
        if spec.remote_port == Some(0) {
            return Err(FedError::InvalidProxy("remote_port must be nonzero".to_string()));
        }

        let direction = match spec.direction {
            LaneSide::Egress => {
                if spec.port == 0 {
                    return Err(FedError::InvalidProxy(
                        "egress lanes need a local port".to_string(),
                    ));
                }
                Direction::Egress {
                    target_peer: parse_peer_id(&spec.target)
                        .map_err(|e| FedError::InvalidProxy(e.to_string()))?,
                }
            }
            LaneSide::Ingress => {
                target_port(&spec.target)?;
                Direction::Ingress {
                    target: spec.target.clone(),
                }
            }
        };

        let tls = match (spec.tls_cert, spec.tls_key) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            _ => {
                return Err(FedError::InvalidProxy(
                    "tls_cert and tls_key go together".to_string(),
                ))
            }
        };
        if tls.is_some()
            && (spec.kind == ProxyKind::Http || spec.direction == LaneSide::Ingress)
        {
            return Err(FedError::InvalidProxy(
                "TLS is only offered on egress tcp and ssh lanes".to_string(),
            ));
        }

        let peer = spec
            .peer
            .as_deref()
            .map(parse_peer_id)
            .transpose()
            .map_err(|e| FedError::InvalidProxy(e.to_string()))?;
        if spec.kind == ProxyKind::Http
            && spec.direction == LaneSide::Ingress
            && (peer.is_none() || spec.remote_port.is_none())
        {
            return Err(FedError::InvalidProxy(
                "ingress http lanes need peer and remote_port".to_string(),
            ));
        }

        if let Some(expires_at) = spec.expires_at {
            if expires_at <= Utc::now() {
                return Err(FedError::InvalidProxy(format!("expired at {}", expires_at)));
            }
        }

        Ok(Self {
            id: spec
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            port: spec.port,
            active: spec.active,
            tls,
            kind: spec.kind,
            direction,
            network: spec.network,
            peer,
            remote_port: spec.remote_port,
            tags: spec.tags,
            expires_at: spec.expires_at,
        })
    }
}

impl From<&ProxyDescriptor> for ProxySpec {
    fn from(desc: &ProxyDescriptor) -> Self {
        let (direction, target) = match &desc.direction {
            Direction::Ingress { target } => (LaneSide::Ingress, target.clone()),
            Direction::Egress { target_peer } => (LaneSide::Egress, target_peer.to_string()),
        };
        Self {
            id: Some(desc.id.clone()),
            port: desc.port,
            active: desc.active,
            kind: desc.kind,
            direction,
            target,
            network: desc.network.clone(),
            peer: desc.peer.map(|p| p.to_string()),
            remote_port: desc.remote_port,
            tls_cert: desc.tls.as_ref().map(|t| t.cert.clone()),
            tls_key: desc.tls.as_ref().map(|t| t.key.clone()),
            tags: desc.tags.clone(),
            expires_at: desc.expires_at,
        }
    }
}

impl ProxyDescriptor {
    pub fn is_egress(&self) -> bool {
        matches!(self.direction, Direction::Egress { .. })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Stream protocol of this lane.
    ///
    /// A lane with both ports known gets its own protocol, derived the
    /// same way on both ends: egress `(port, local, remote_port, target)`
    /// equals ingress `(remote_port, peer, target port, local)`. Other
    /// lanes share the default protocol of their kind.
    pub fn protocol(&self, local_peer: &PeerId) -> Result<StreamProtocol> {
        match &self.direction {
            Direction::Egress { target_peer } => {
                if let Some(remote_port) = self.remote_port {
                    return tunnel_protocol_for(self.port, local_peer, remote_port, target_peer);
                }
            }
            Direction::Ingress { target } => {
                if let (Some(origin), Some(origin_port)) = (&self.peer, self.remote_port) {
                    return tunnel_protocol_for(origin_port, origin, target_port(target)?, local_peer);
                }
            }
        }
        Ok(match self.kind {
            ProxyKind::Http => REQUEST_PROTOCOL,
            ProxyKind::Tcp | ProxyKind::Ssh => TUNNEL_PROTOCOL,
        })
    }
}
