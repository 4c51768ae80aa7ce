//! Error types for Fedlink
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

/// Result type alias for Fedlink operations
pub type Result<T> = std::result::Result<T, FedError>;

/// Unified error type for all Fedlink operations
#[derive(Error, Debug)]
pub enum FedError {
    // ─────────────────────────────────────────────────────────────
    // Configuration / Parse Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid peer ID format: {0}")]
    InvalidPeerId(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid proxy descriptor: {0}")]
    InvalidProxy(String),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to initialize P2P network: {0}")]
    NetworkInitialization(String),

    #[error("Failed to open stream to {peer_id}: {reason}")]
    StreamOpen { peer_id: String, reason: String },

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Dial error: {0}")]
    DialError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Failed to bind to {addr}: {reason}")]
    PortBindFailed { addr: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Policy Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Peer is busy: {0}")]
    Busy(String),

    // ─────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Address {address} already belongs to node {owner}")]
    AddressConflict { address: String, owner: String },

    #[error("Registry error: {0}")]
    Registry(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FedError {
    /// Whether this error is a transient transport failure worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FedError::StreamOpen { .. }
                | FedError::StreamError(_)
                | FedError::DialError(_)
                | FedError::Timeout(_)
                | FedError::TlsHandshake(_)
                | FedError::Io(_)
        )
    }

    /// HTTP status reported for this error at the API boundaries
    pub fn status_code(&self) -> u16 {
        match self {
            FedError::InvalidAddress(_)
            | FedError::InvalidPeerId(_)
            | FedError::MalformedRequest(_)
            | FedError::InvalidProxy(_)
            | FedError::Serialization(_) => 400,
            FedError::Unauthorized(_) => 401,
            FedError::Rejected(_) => 403,
            FedError::NodeNotFound(_) | FedError::NetworkNotFound(_) => 404,
            FedError::AddressConflict { .. } => 409,
            FedError::Busy(_) => 429,
            FedError::StreamOpen { .. }
            | FedError::StreamError(_)
            | FedError::DialError(_)
            | FedError::MalformedResponse(_)
            | FedError::TlsHandshake(_) => 502,
            FedError::Timeout(_) => 504,
            _ => 500,
        }
    }
}

impl From<libp2p::noise::Error> for FedError {
    fn from(err: libp2p::noise::Error) -> Self {
        FedError::NetworkInitialization(err.to_string())
    }
}

impl From<libp2p::TransportError<std::io::Error>> for FedError {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        FedError::NetworkInitialization(err.to_string())
    }
}

impl From<libp2p::multiaddr::Error> for FedError {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        FedError::InvalidAddress(err.to_string())
    }
}

impl From<serde_json::Error> for FedError {
    fn from(err: serde_json::Error) -> Self {
        FedError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for FedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FedError::Timeout(err.to_string())
        } else {
            FedError::StreamError(err.to_string())
        }
    }
}

impl From<rustls::Error> for FedError {
    fn from(err: rustls::Error) -> Self {
        FedError::TlsHandshake(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FedError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        FedError::Timeout(err.to_string())
    }
}
