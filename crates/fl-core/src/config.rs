//! Configuration management for Fedlink
//!
//! Handles loading and saving of the node configuration including
//! identity key location, API binding, sync timing, bootstrap networks,
//! seed nodes and proxy lanes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FedError, Result};
use crate::proxy::{ProxyDescriptor, ProxySpec};

/// A network this node creates (or joins) at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSeed {
    pub name: String,
    pub password: String,
}

/// A node registered at startup, e.g. the first peer of a network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSeed {
    pub name: String,
    pub addresses: Vec<String>,
    #[serde(default)]
    pub add_to_network: Option<String>,
}

/// Main configuration for Fedlink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FedConfig {
    /// Path to the identity keypair file
    pub identity_path: PathBuf,

    /// Human readable name of this node
    pub node_name: String,

    /// Port for the p2p listeners (0 = random)
    pub listen_port: u16,

    /// Bind address of the admin HTTP API
    pub api_bind: String,

    /// Bearer token accepted for admin calls (None = admin API refuses every call)
    pub admin_token: Option<String>,

    /// Loopback HTTP service that incoming bridged requests are forwarded to
    pub local_service_url: Option<String>,

    /// Path prefixes peers may reach through the request bridge (empty = all)
    pub path_prefix_whitelist: Vec<String>,

    /// Only accept bridged requests from members of this network
    pub restrict_to_network: Option<String>,

    /// Upper bound for a single request bridge exchange, in seconds
    pub request_timeout_secs: u64,

    /// Sleep between two sync passes of a network, in seconds
    pub sync_interval_secs: u64,

    /// Members synced more recently than this are skipped, in seconds
    pub sync_staleness_secs: u64,

    /// Networks created at startup
    pub networks: Vec<NetworkSeed>,

    /// Nodes registered at startup
    pub nodes: Vec<NodeSeed>,

    /// Proxy lanes started at startup
    pub proxies: Vec<ProxySpec>,

    /// Enable debug logging
    pub debug: bool,
}

impl Default for FedConfig {
    fn default() -> Self {
        Self {
            identity_path: Self::default_identity_path(),
            node_name: "fedlink-node".to_string(),
            listen_port: 0,
            api_bind: "127.0.0.1:8470".to_string(),
            admin_token: None,
            local_service_url: None,
            path_prefix_whitelist: Vec::new(),
            restrict_to_network: None,
            request_timeout_secs: 30,
            sync_interval_secs: 30,
            sync_staleness_secs: 60,
            networks: Vec::new(),
            nodes: Vec::new(),
            proxies: Vec::new(),
            debug: false,
        }
    }
}

impl FedConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file and validates it
    pub fn load(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| FedError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| FedError::ConfigError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Checks values that would otherwise fail deep inside a running daemon
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(FedError::ConfigError(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(FedError::ConfigError(
                "sync_interval_secs must be positive".to_string(),
            ));
        }
        if let Some(url) = &self.local_service_url {
            reqwest::Url::parse(url)
                .map_err(|e| FedError::ConfigError(format!("local_service_url: {}", e)))?;
        }
        for network in &self.networks {
            if network.name.is_empty() {
                return Err(FedError::ConfigError("network name is empty".to_string()));
            }
        }
        self.proxy_descriptors()?;
        Ok(())
    }

    /// Converts the configured proxy lanes into validated descriptors
    pub fn proxy_descriptors(&self) -> Result<Vec<ProxyDescriptor>> {
        self.proxies
            .iter()
            .cloned()
            .map(ProxyDescriptor::try_from)
            .collect()
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fedlink")
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default identity keypair path
    pub fn default_identity_path() -> PathBuf {
        Self::default_config_dir().join("identity.key")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_staleness(&self) -> Duration {
        Duration::from_secs(self.sync_staleness_secs)
    }

    /// Builder pattern: set listen port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder pattern: set node name
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Builder pattern: set admin API bind address
    pub fn with_api_bind(mut self, bind: impl Into<String>) -> Self {
        self.api_bind = bind.into();
        self
    }

    /// Builder pattern: set admin token
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// Builder pattern: set the loopback service incoming requests go to
    pub fn with_local_service_url(mut self, url: impl Into<String>) -> Self {
        self.local_service_url = Some(url.into());
        self
    }

    /// Builder pattern: add a bootstrap network
    pub fn with_network(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.networks.push(NetworkSeed {
            name: name.into(),
            password: password.into(),
        });
        self
    }

    /// Builder pattern: set debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FedConfig::default();
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.sync_staleness(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = FedConfig::new()
            .with_listen_port(4001)
            .with_node_name("n1")
            .with_network("hive", "secret")
            .with_debug(true);

        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.node_name, "n1");
        assert_eq!(config.networks.len(), 1);
        assert!(config.debug);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let peer = libp2p::PeerId::random();
        let raw = format!(
            r#"
            node_name = "alpha"

            [[networks]]
            name = "hive"
            password = "pw"

            [[proxies]]
            port = 5433
            kind = "tcp"
            direction = "egress"
            target = "{}"
            "#,
            peer
        );
        let config: FedConfig = toml::from_str(&raw).unwrap();

        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.networks[0].name, "hive");
        assert_eq!(config.proxy_descriptors().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = FedConfig::default();
        config.sync_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
