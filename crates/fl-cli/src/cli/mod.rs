//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod info;
pub mod init;
pub mod run;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use fl_core::FedConfig;

/// Fedlink - federated peer overlay
///
/// Joins password-gated networks of nodes over libp2p, bridges HTTP
/// requests and TCP tunnels between members.
#[derive(Parser, Debug)]
#[command(name = "fedlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node
    ///
    /// Starts the swarm, the admin API, network sync and any configured
    /// proxy lanes. Stops on Ctrl-C.
    #[command(visible_alias = "r")]
    Run {
        /// Configuration file (defaults to the user config directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Write a default configuration file
    Init {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show node information
    ///
    /// Displays the local peer ID and where configuration lives.
    #[command(visible_alias = "i")]
    Info {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Command-line values that replace the file configuration
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Node name advertised to peers
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Port for the p2p listeners (0 picks one)
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Address of the admin API
    #[arg(long, value_name = "ADDR")]
    pub api_bind: Option<String>,

    /// Bearer token for the admin API
    #[arg(long, env = "FEDLINK_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// HTTP service that answers bridged requests
    #[arg(long, value_name = "URL")]
    pub local_service: Option<String>,

    /// Network to create or join, as NAME:PASSWORD (repeatable)
    #[arg(long = "network", value_name = "NAME:PASSWORD")]
    pub networks: Vec<String>,
}

impl Overrides {
    pub fn apply(self, mut config: FedConfig) -> Result<FedConfig> {
        if let Some(name) = self.name {
            config = config.with_node_name(name);
        }
        if let Some(port) = self.port {
            config = config.with_listen_port(port);
        }
        if let Some(bind) = self.api_bind {
            config = config.with_api_bind(bind);
        }
        if let Some(token) = self.admin_token {
            config = config.with_admin_token(token);
        }
        if let Some(url) = self.local_service {
            config = config.with_local_service_url(url);
        }
        for seed in self.networks {
            let Some((name, password)) = seed.split_once(':') else {
                bail!("--network expects NAME:PASSWORD, got {}", seed);
            };
            config = config.with_network(name, password);
        }
        Ok(config)
    }
}

/// Load the file at `path`, or the default location when it exists
pub fn load_config(path: Option<PathBuf>) -> Result<FedConfig> {
    match path {
        Some(path) => {
            FedConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let path = FedConfig::default_config_path();
            if path.exists() {
                FedConfig::load(&path).with_context(|| format!("loading {}", path.display()))
            } else {
                Ok(FedConfig::default())
            }
        }
    }
}
