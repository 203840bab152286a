//! Relay hub for collaborative document synchronization.
//!
//! One authoritative replica, many websocket sessions. Inbound updates are
//! merged into the replica and rebroadcast verbatim to every other session;
//! cursor updates are relayed without touching document state.

pub mod hub;
pub mod server;

pub use hub::{RelayHub, RelayStats, SessionId, SessionState};
pub use server::{RelayServer, ServerConfig};
