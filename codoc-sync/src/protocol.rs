//! Wire protocol between clients and the relay.
//!
//! Messages are bincode-encoded and carried as binary websocket frames.
//! Document payloads stay opaque `Vec<u8>` at this layer: the relay
//! rebroadcasts the exact bytes it received, so clients always decode the
//! sender's original update.

use crate::DecodeError;
use codoc_doc::NodeKey;
use serde::{Deserialize, Serialize};

/// Ephemeral cursor state for one user. Last write per `user_id` wins;
/// records are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub user_id: String,
    pub user_name: String,
    /// Key of the text node the cursor is anchored in
    pub anchor_key: NodeKey,
    /// Grapheme offset within the anchor node
    pub anchor_offset: u32,
    /// Display color for the remote caret
    pub color: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Relay to a newly connected client: the full document state
    SyncUpdate(Vec<u8>),
    /// Client to relay: a local change to merge and fan out
    Update(Vec<u8>),
    /// Relay to everyone but the sender: a verbatim rebroadcast
    BroUpdate(Vec<u8>),
    /// Ephemeral cursor broadcast, relayed without document state
    CursorUpdate(CursorRecord),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, crate::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| crate::EncodeError::Failed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Ok(msg)
    }
}
