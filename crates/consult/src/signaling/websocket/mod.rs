//! WebSocket signaling server for the JSON-RPC 2.0 protocol
//!
//! Browser clients connect here, join a session and exchange negotiation,
//! chat and recording traffic with the session core.

mod handler;
mod server;

pub use handler::SharedState;
pub use server::{WebSocketServerHandle, WebSocketSignalingServer};
