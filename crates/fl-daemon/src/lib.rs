//! Fedlink Daemon
//!
//! Background service that runs one overlay node and its admin API.

pub mod api;
pub mod server;

pub use api::{router, ApiState, SharedState};
pub use server::{DaemonCommand, DaemonEvent, DaemonServer};
