//! Network Sync
//!
//! Pairwise, pull-based anti-entropy of network membership. Each network
//! has one periodic task; each pass logs in to every stale member, asks
//! what it knows (SyncGet), merges the answer and pushes back what the
//! member was missing.

pub mod exchange;
pub mod pass;
pub mod supervisor;

pub use exchange::{
    accept_push, respond_sync_get, LoginRequest, SyncGetRequest, SyncGetResponse,
    SyncPushRequest, SyncPushResponse,
};
pub use pass::{NetworkSyncer, PassReport};
pub use supervisor::{PassGuard, SyncPass, SyncSupervisor};
