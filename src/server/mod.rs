//! WebSocket server module
//!
//! Handles WebSocket connections from canvas clients and routes their
//! requests to the session registry.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
