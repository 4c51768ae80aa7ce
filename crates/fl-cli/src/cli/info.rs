//! Info Command Implementation

use anyhow::Result;
use std::path::PathBuf;

use fl_core::PeerIdentity;

use super::load_config;

/// Print the peer id and file locations
pub fn run(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    let identity = PeerIdentity::load_or_generate(&config.identity_path)?;

    println!("Node name:     {}", config.node_name);
    println!("Peer ID:       {}", identity.peer_id());
    println!("Identity file: {}", config.identity_path.display());
    println!("Admin API:     {}", config.api_bind);
    if !config.networks.is_empty() {
        let names: Vec<&str> = config.networks.iter().map(|n| n.name.as_str()).collect();
        println!("Networks:      {}", names.join(", "));
    }
    if !config.proxies.is_empty() {
        println!("Proxy lanes:   {}", config.proxies.len());
    }
    Ok(())
}
