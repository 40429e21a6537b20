//! The request-scoped RPC protocol shared by every worker
//!
//! - [`wire`]: request/response/notification frame shapes
//! - [`frame`]: HTTP dispatcher with path-prefix secret auth + WebSocket
//! - [`client`]: JSON-over-HTTP and WebSocket clients with reconnect

pub mod client;
pub mod frame;
pub mod wire;
