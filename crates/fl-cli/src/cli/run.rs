//! Run Command Implementation

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn};

use fl_daemon::{DaemonCommand, DaemonEvent, DaemonServer};

use super::{load_config, Overrides};

/// Run a node until Ctrl-C
pub async fn run(config: Option<PathBuf>, overrides: Overrides) -> Result<()> {
    let config = overrides.apply(load_config(config)?)?;
    if config.admin_token.is_none() {
        warn!("No admin token configured, admin API calls will be refused");
    }

    let mut daemon = DaemonServer::new(config).await?;
    let command_tx = daemon.command_sender();
    let mut event_rx = daemon.take_event_receiver();

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                DaemonEvent::Ready { peer_id, api_addr } => {
                    println!("\nFedlink node {}", peer_id);
                    println!("Admin API: http://{}\n", api_addr);
                }
                DaemonEvent::Listening { address } => info!("Listening on {}", address),
                DaemonEvent::PeerConnected { peer_id } => info!("Peer connected: {}", peer_id),
                DaemonEvent::PeerDisconnected { peer_id } => {
                    info!("Peer disconnected: {}", peer_id)
                }
                DaemonEvent::Error { message } => warn!("{}", message),
                DaemonEvent::Shutdown => break,
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = command_tx.send(DaemonCommand::Shutdown).await;
        }
    });

    daemon.start().await?;
    daemon.run().await?;
    Ok(())
}
