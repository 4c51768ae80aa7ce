//! Per-network sync tasks
//!
//! One long-lived task per network, each independently cancellable. The
//! running tasks and the set of networks with a pass in progress live under
//! a single mutex, so a second pass for a network is skipped, never queued
//! and never run alongside the first.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pass::PassReport;
use crate::error::Result;

/// One sync pass over a network
#[async_trait]
pub trait SyncPass: Send + Sync {
    async fn run_pass(&self, network: &str) -> Result<PassReport>;
}

struct SyncTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    tasks: HashMap<String, SyncTask>,
    busy: HashSet<String>,
}

/// Marks a network as mid-pass until dropped
pub struct PassGuard {
    state: Arc<Mutex<SupervisorState>>,
    network: String,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.state.lock().busy.remove(&self.network);
    }
}

/// Starts, stops and tracks the sync task of each network
#[derive(Clone, Default)]
pub struct SyncSupervisor {
    state: Arc<Mutex<SupervisorState>>,
}

impl SyncSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `network` for one pass; `None` if a pass is already running
    pub fn try_begin_pass(&self, network: &str) -> Option<PassGuard> {
        let mut state = self.state.lock();
        if !state.busy.insert(network.to_string()) {
            return None;
        }
        Some(PassGuard {
            state: Arc::clone(&self.state),
            network: network.to_string(),
        })
    }

    pub fn is_syncing(&self, network: &str) -> bool {
        self.state.lock().busy.contains(network)
    }

    /// Networks with a running sync task, sorted
    pub fn active_networks(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.tasks.retain(|_, task| !task.handle.is_finished());
        let mut names: Vec<String> = state.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one pass right now unless one is already in progress
    pub async fn run_pass_now(
        &self,
        network: &str,
        pass: &dyn SyncPass,
    ) -> Option<Result<PassReport>> {
        let _guard = self.try_begin_pass(network)?;
        Some(pass.run_pass(network).await)
    }

    /// Start the periodic task of `network`. Returns false if one is
    /// already running.
    pub fn start(&self, network: &str, pass: Arc<dyn SyncPass>, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get(network) {
            if !task.handle.is_finished() {
                return false;
            }
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.clone(),
            network.to_string(),
            pass,
            interval,
            shutdown.clone(),
        ));
        state
            .tasks
            .insert(network.to_string(), SyncTask { shutdown, handle });
        info!("Started sync for network {} every {:?}", network, interval);
        true
    }

    /// Stop the task of `network`; other networks are unaffected
    pub fn stop(&self, network: &str) -> bool {
        let task = self.state.lock().tasks.remove(network);
        match task {
            Some(task) => {
                task.shutdown.cancel();
                info!("Stopped sync for network {}", network);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let tasks: Vec<(String, SyncTask)> = self.state.lock().tasks.drain().collect();
        for (network, task) in tasks {
            task.shutdown.cancel();
            debug!("Stopped sync for network {}", network);
        }
    }
}

async fn run_loop(
    supervisor: SyncSupervisor,
    network: String,
    pass: Arc<dyn SyncPass>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        match supervisor.try_begin_pass(&network) {
            Some(_guard) => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = pass.run_pass(&network) => {
                        if let Err(e) = result {
                            warn!("Sync pass for {} failed: {}", network, e);
                        }
                    }
                }
            }
            None => debug!("Sync pass for {} already running, skipping", network),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Sync loop for {} exited", network);
}
