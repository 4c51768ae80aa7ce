//! Network service accounts
//!
//! Every network gets one account whose name is the network name and whose
//! password is the network secret. Peers log in to it before syncing and
//! receive a short-lived session token.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FedError, Result};

/// Cookie carrying the session token
pub const SESSION_COOKIE: &str = "session_id";

/// Default session lifetime
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

struct Session {
    network: String,
    expires_at: Instant,
}

/// Service accounts and their live sessions
pub struct SessionStore {
    accounts: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create the service account of `network`; an existing account is kept
    pub fn provision(&self, network: &str, password: &str) {
        let mut accounts = self.accounts.write();
        if !accounts.contains_key(network) {
            info!("Provisioned service account for network {}", network);
            accounts.insert(network.to_string(), password.to_string());
        }
    }

    pub fn has_account(&self, network: &str) -> bool {
        self.accounts.read().contains_key(network)
    }

    /// Check credentials and open a session
    pub fn login(&self, network: &str, password: &str) -> Result<String> {
        let valid = self
            .accounts
            .read()
            .get(network)
            .is_some_and(|stored| stored == password);
        if !valid {
            return Err(FedError::Unauthorized(format!(
                "bad credentials for network {}",
                network
            )));
        }

        self.purge_expired();
        let token = Uuid::new_v4().to_string();
        self.sessions.write().insert(
            token.clone(),
            Session {
                network: network.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!("Opened session for network {}", network);
        Ok(token)
    }

    /// Whether `token` is a live session of `network`
    pub fn validate(&self, token: &str, network: &str) -> bool {
        self.sessions
            .read()
            .get(token)
            .is_some_and(|s| s.network == network && s.expires_at > Instant::now())
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions.write().retain(|_, s| s.expires_at > now);
    }
}

/// Pull the session token out of a `Set-Cookie` header value
pub fn session_from_set_cookie(header: &str) -> Option<&str> {
    header
        .split(';')
        .next()
        .and_then(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}
