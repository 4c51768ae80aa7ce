//! Request Bridge
//!
//! HTTP/1.1 requests and responses carried over peer streams. The same
//! bridge moves proxied application calls and federation control calls.

pub mod client;
pub mod codec;
pub mod incoming;

pub use client::RequestBridge;
pub use codec::{BridgeRequest, BridgeResponse, Headers};
pub use incoming::{IncomingRequestHandler, LocalService, LoopbackService, RoutedService};
