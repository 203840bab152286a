//! Remote cursor tracking.
//!
//! Cursor records are ephemeral: one slot per user, last write wins, nothing
//! is persisted or merged into document state. Rendering resolves each
//! record against the current tree; a record whose anchor node is gone stays
//! stored but resolves to [`CursorPlacement::Unanchored`].

use codoc_doc::{clamp_grapheme_offset, DocumentTree, NodeKey};
use codoc_sync::CursorRecord;
use std::collections::HashMap;

/// Where a remote cursor lands in the current tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPlacement {
    Anchored { key: NodeKey, offset: usize },
    /// The anchor node no longer exists; render nothing
    Unanchored,
}

#[derive(Debug, Default)]
pub struct AwarenessTracker {
    records: HashMap<String, CursorRecord>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the record for its user.
    pub fn observe(&mut self, record: CursorRecord) {
        self.records.insert(record.user_id.clone(), record);
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.records.remove(user_id).is_some()
    }

    pub fn records(&self) -> impl Iterator<Item = &CursorRecord> {
        self.records.values()
    }

    pub fn get(&self, user_id: &str) -> Option<&CursorRecord> {
        self.records.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Resolve a cursor record against the tree, clamping the offset to the
/// anchor node's grapheme length.
pub fn resolve(tree: &DocumentTree, record: &CursorRecord) -> CursorPlacement {
    match tree.find_text_node(record.anchor_key) {
        Some(node) => CursorPlacement::Anchored {
            key: record.anchor_key,
            offset: clamp_grapheme_offset(&node.text, record.anchor_offset as usize),
        },
        None => CursorPlacement::Unanchored,
    }
}
