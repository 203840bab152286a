//! Replicated document state and update exchange.
//!
//! A [`Replica`] holds the conflict-free representation of one document:
//! an RGA sequence for block order, an RGA character sequence per text node,
//! and LWW registers for node kinds and attributes. Every mutation is an
//! operation with a unique [`OpId`]; replicas exchange [`Update`] batches and
//! converge regardless of delivery order or duplication.

use codoc_core::{LwwRegister, Map, OpId, PeerId, Sequence, SequenceOp, StateVector};
use codoc_doc::{BlockKind, BlockNode, DocumentTree, InlineNode, NodeKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod protocol;

pub use protocol::{CursorRecord, WireMessage};

/// Malformed update or state-vector bytes. Decoding happens before any
/// replica state is touched, so a failed decode never partially applies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed update: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("encode failed: {0}")]
    Failed(String),
}

/// One replicated operation. Inserts carry the anchor and right origin they
/// were created against so every replica resolves the same ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocOp {
    InsertBlock {
        id: OpId,
        key: NodeKey,
        kind: String,
        after: Option<OpId>,
        right_origin: Option<OpId>,
    },
    RemoveBlock {
        id: OpId,
        target: OpId,
    },
    InsertInline {
        id: OpId,
        block: NodeKey,
        key: NodeKey,
        after: Option<OpId>,
        right_origin: Option<OpId>,
    },
    RemoveInline {
        id: OpId,
        block: NodeKey,
        target: OpId,
    },
    InsertText {
        id: OpId,
        node: NodeKey,
        ch: char,
        after: Option<OpId>,
        right_origin: Option<OpId>,
    },
    DeleteText {
        id: OpId,
        node: NodeKey,
        target: OpId,
    },
    SetKind {
        id: OpId,
        node: NodeKey,
        kind: String,
    },
    SetAttr {
        id: OpId,
        node: NodeKey,
        name: String,
        value: String,
    },
}

impl DocOp {
    pub fn id(&self) -> OpId {
        match self {
            DocOp::InsertBlock { id, .. }
            | DocOp::RemoveBlock { id, .. }
            | DocOp::InsertInline { id, .. }
            | DocOp::RemoveInline { id, .. }
            | DocOp::InsertText { id, .. }
            | DocOp::DeleteText { id, .. }
            | DocOp::SetKind { id, .. }
            | DocOp::SetAttr { id, .. } => *id,
        }
    }
}

/// A batch of operations in causal order per peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<DocOp>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EncodeError::Failed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Ok(update)
    }

    /// State vector covered by the operations in this update.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op in &self.ops {
            sv.observe(op.id());
        }
        sv
    }
}

pub fn encode_state_vector(sv: &StateVector) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(sv, bincode::config::standard())
        .map_err(|e| EncodeError::Failed(e.to_string()))
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DecodeError> {
    let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(sv)
}

/// Validation errors for incoming updates
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed operation {op_id:?}: {reason}")]
    MalformedOperation { op_id: OpId, reason: String },
    #[error("resource limit exceeded: {actual} > {limit}")]
    ResourceLimitExceeded { limit: usize, actual: usize },
    #[error("pending operation buffer full (capacity {capacity})")]
    BufferFull { capacity: usize },
}

/// Configuration for validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_ops_per_update: usize,
    pub max_attr_bytes: usize,
    pub max_pending_buffer: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_ops_per_update: 10_000,
            max_attr_bytes: 64 * 1024,
            max_pending_buffer: 100_000,
        }
    }
}

/// Validate a decoded update against configured limits
pub fn validate_update(
    update: &Update,
    limits: &ValidationLimits,
    pending_count: usize,
) -> Result<(), ValidationError> {
    if update.ops.len() > limits.max_ops_per_update {
        return Err(ValidationError::ResourceLimitExceeded {
            limit: limits.max_ops_per_update,
            actual: update.ops.len(),
        });
    }

    if pending_count + update.ops.len() > limits.max_pending_buffer {
        return Err(ValidationError::BufferFull {
            capacity: limits.max_pending_buffer,
        });
    }

    for op in &update.ops {
        if op.id().counter == 0 {
            return Err(ValidationError::MalformedOperation {
                op_id: op.id(),
                reason: "counter cannot be zero".to_string(),
            });
        }
        if let DocOp::SetAttr { name, value, .. } = op
            && name.len() + value.len() > limits.max_attr_bytes
        {
            return Err(ValidationError::MalformedOperation {
                op_id: op.id(),
                reason: "attribute exceeds size limit".to_string(),
            });
        }
    }

    Ok(())
}

/// Result of applying an update
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    /// Operations that were applied
    pub applied: Vec<OpId>,
    /// Operations buffered until the node they target exists
    pub buffered: Vec<OpId>,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeState {
    Block {
        kind: LwwRegister<String>,
        attrs: Map<String, String>,
        inlines: Sequence<NodeKey>,
    },
    Text {
        content: Sequence<char>,
    },
}

/// One participant's replicated document state.
#[derive(Debug, Clone)]
pub struct Replica {
    peer: PeerId,
    clock: u64,
    blocks: Sequence<NodeKey>,
    nodes: BTreeMap<NodeKey, NodeState>,
    log: BTreeMap<OpId, DocOp>,
    /// Locally generated operations not yet handed to the transport
    outbox: BTreeSet<OpId>,
    /// Remote operations waiting for the node they target
    pending: Vec<DocOp>,
}

impl Replica {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            clock: 0,
            blocks: Sequence::new(),
            nodes: BTreeMap::new(),
            log: BTreeMap::new(),
            outbox: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    /// Seed a replica from an existing tree. The seed operations land in the
    /// outbox like any other local edit.
    pub fn from_tree(peer: PeerId, tree: &DocumentTree) -> Self {
        let mut replica = Self::new(peer);
        for (idx, block) in tree.blocks.iter().enumerate() {
            replica.insert_block(idx, block.key, block.kind);
            for (inline_idx, inline) in block.children.iter().enumerate() {
                replica.insert_inline(block.key, inline_idx, inline.key);
                for (ch_idx, ch) in inline.text.chars().enumerate() {
                    replica.insert_text(inline.key, ch_idx, ch);
                }
            }
        }
        replica
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    fn next_id(&mut self) -> OpId {
        self.clock += 1;
        OpId {
            counter: self.clock,
            peer: self.peer,
        }
    }

    fn record_local(&mut self, op: DocOp) {
        let id = op.id();
        self.log.insert(id, op);
        self.outbox.insert(id);
    }

    // ---- local mutations (bridge-facing) ----

    /// Insert a block node at a visible position.
    pub fn insert_block(&mut self, index: usize, key: NodeKey, kind: BlockKind) {
        let id = self.next_id();
        let after = visible_anchor(&self.blocks, index);
        let op = self.blocks.make_insert(after, key, id);
        let SequenceOp::Insert { right_origin, .. } = op else {
            return;
        };
        self.blocks.apply(SequenceOp::Insert {
            after,
            id,
            value: key,
            right_origin,
        });
        self.nodes.insert(
            key,
            NodeState::Block {
                kind: LwwRegister::new(kind.type_name().to_string(), id),
                attrs: Map::new(),
                inlines: Sequence::new(),
            },
        );
        self.record_local(DocOp::InsertBlock {
            id,
            key,
            kind: kind.type_name().to_string(),
            after,
            right_origin,
        });
        if let BlockKind::Heading { level } = kind {
            self.set_attr(key, "level", &level.to_string());
        }
    }

    pub fn remove_block(&mut self, key: NodeKey) {
        let Some(target) = elem_of(&self.blocks, key) else {
            return;
        };
        let id = self.next_id();
        self.blocks.delete(target, id);
        self.record_local(DocOp::RemoveBlock { id, target });
    }

    pub fn insert_inline(&mut self, block: NodeKey, index: usize, key: NodeKey) {
        let Some(NodeState::Block { inlines, .. }) = self.nodes.get_mut(&block) else {
            return;
        };
        let after = visible_anchor(inlines, index);
        // id allocation needs &mut self, so compute the anchor first
        let right_origin = match inlines.make_insert(after, key, OpId { counter: 0, peer: 0 }) {
            SequenceOp::Insert { right_origin, .. } => right_origin,
            SequenceOp::Delete { .. } => None,
        };
        let id = self.next_id();
        if let Some(NodeState::Block { inlines, .. }) = self.nodes.get_mut(&block) {
            inlines.apply(SequenceOp::Insert {
                after,
                id,
                value: key,
                right_origin,
            });
        }
        self.nodes.insert(
            key,
            NodeState::Text {
                content: Sequence::new(),
            },
        );
        self.record_local(DocOp::InsertInline {
            id,
            block,
            key,
            after,
            right_origin,
        });
    }

    pub fn remove_inline(&mut self, block: NodeKey, key: NodeKey) {
        let Some(NodeState::Block { inlines, .. }) = self.nodes.get(&block) else {
            return;
        };
        let Some(target) = elem_of(inlines, key) else {
            return;
        };
        let id = self.next_id();
        if let Some(NodeState::Block { inlines, .. }) = self.nodes.get_mut(&block) {
            inlines.delete(target, id);
        }
        self.record_local(DocOp::RemoveInline { id, block, target });
    }

    /// Insert one character at a visible offset of a text node.
    pub fn insert_text(&mut self, node: NodeKey, index: usize, ch: char) {
        let Some(NodeState::Text { content }) = self.nodes.get(&node) else {
            return;
        };
        let after = visible_anchor(content, index);
        let right_origin = match content.make_insert(after, ch, OpId { counter: 0, peer: 0 }) {
            SequenceOp::Insert { right_origin, .. } => right_origin,
            SequenceOp::Delete { .. } => None,
        };
        let id = self.next_id();
        if let Some(NodeState::Text { content }) = self.nodes.get_mut(&node) {
            content.apply(SequenceOp::Insert {
                after,
                id,
                value: ch,
                right_origin,
            });
        }
        self.record_local(DocOp::InsertText {
            id,
            node,
            ch,
            after,
            right_origin,
        });
    }

    /// Delete the character at a visible offset of a text node.
    pub fn delete_text(&mut self, node: NodeKey, index: usize) {
        let Some(NodeState::Text { content }) = self.nodes.get(&node) else {
            return;
        };
        let Some((target, _)) = content.visible_entries().nth(index) else {
            return;
        };
        let id = self.next_id();
        if let Some(NodeState::Text { content }) = self.nodes.get_mut(&node) {
            content.delete(target, id);
        }
        self.record_local(DocOp::DeleteText { id, node, target });
    }

    pub fn set_kind(&mut self, node: NodeKey, kind: &str) {
        let id = self.next_id();
        let Some(NodeState::Block { kind: register, .. }) = self.nodes.get_mut(&node) else {
            return;
        };
        register.set(kind.to_string(), id);
        self.record_local(DocOp::SetKind {
            id,
            node,
            kind: kind.to_string(),
        });
    }

    pub fn set_attr(&mut self, node: NodeKey, name: &str, value: &str) {
        let id = self.next_id();
        let Some(NodeState::Block { attrs, .. }) = self.nodes.get_mut(&node) else {
            return;
        };
        attrs.set(name.to_string(), value.to_string(), id);
        self.record_local(DocOp::SetAttr {
            id,
            node,
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    // ---- update exchange ----

    /// State vector of everything in the operation log.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op_id in self.log.keys() {
            sv.observe(*op_id);
        }
        sv
    }

    /// Everything the given state vector has not seen.
    pub fn update_since(&self, since: &StateVector) -> Update {
        let ops = self
            .log
            .values()
            .filter(|op| !since.contains(op.id()))
            .cloned()
            .collect();
        Update { ops }
    }

    /// The whole history, for a joining peer.
    pub fn full_update(&self) -> Update {
        self.update_since(&StateVector::new())
    }

    /// Drain locally generated operations into an update.
    pub fn take_outbox(&mut self) -> Update {
        let ops = self
            .outbox
            .iter()
            .filter_map(|id| self.log.get(id).cloned())
            .collect();
        self.outbox.clear();
        Update { ops }
    }

    /// Merge a remote update. Duplicates are skipped; operations targeting a
    /// node that has not arrived yet are buffered and retried as soon as the
    /// missing operation lands.
    pub fn apply_update(&mut self, update: &Update) -> ApplyResult {
        let mut result = ApplyResult::default();
        let mut queue: Vec<DocOp> = std::mem::take(&mut self.pending);
        queue.extend(update.ops.iter().cloned());

        loop {
            let mut progressed = false;
            let mut remaining = Vec::new();
            for op in queue {
                let id = op.id();
                if self.log.contains_key(&id) {
                    continue;
                }
                if self.op_ready(&op) {
                    self.apply_ready(&op);
                    self.clock = self.clock.max(id.counter);
                    self.log.insert(id, op);
                    result.applied.push(id);
                    progressed = true;
                } else {
                    remaining.push(op);
                }
            }
            queue = remaining;
            if !progressed || queue.is_empty() {
                break;
            }
        }

        result.buffered = queue.iter().map(DocOp::id).collect();
        self.pending = queue;
        result
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn op_ready(&self, op: &DocOp) -> bool {
        match op {
            DocOp::InsertBlock { .. } | DocOp::RemoveBlock { .. } => true,
            DocOp::InsertInline { block, .. } | DocOp::RemoveInline { block, .. } => {
                matches!(self.nodes.get(block), Some(NodeState::Block { .. }))
            }
            DocOp::InsertText { node, .. } | DocOp::DeleteText { node, .. } => {
                matches!(self.nodes.get(node), Some(NodeState::Text { .. }))
            }
            DocOp::SetKind { node, .. } | DocOp::SetAttr { node, .. } => {
                matches!(self.nodes.get(node), Some(NodeState::Block { .. }))
            }
        }
    }

    fn apply_ready(&mut self, op: &DocOp) {
        match op {
            DocOp::InsertBlock {
                id,
                key,
                kind,
                after,
                right_origin,
            } => {
                self.blocks.apply(SequenceOp::Insert {
                    after: *after,
                    id: *id,
                    value: *key,
                    right_origin: *right_origin,
                });
                self.nodes.entry(*key).or_insert_with(|| NodeState::Block {
                    kind: LwwRegister::new(kind.clone(), *id),
                    attrs: Map::new(),
                    inlines: Sequence::new(),
                });
            }
            DocOp::RemoveBlock { id, target } => {
                self.blocks.delete(*target, *id);
            }
            DocOp::InsertInline {
                id,
                block,
                key,
                after,
                right_origin,
            } => {
                if let Some(NodeState::Block { inlines, .. }) = self.nodes.get_mut(block) {
                    inlines.apply(SequenceOp::Insert {
                        after: *after,
                        id: *id,
                        value: *key,
                        right_origin: *right_origin,
                    });
                }
                self.nodes.entry(*key).or_insert_with(|| NodeState::Text {
                    content: Sequence::new(),
                });
            }
            DocOp::RemoveInline { id, block, target } => {
                if let Some(NodeState::Block { inlines, .. }) = self.nodes.get_mut(block) {
                    inlines.delete(*target, *id);
                }
            }
            DocOp::InsertText {
                id,
                node,
                ch,
                after,
                right_origin,
            } => {
                if let Some(NodeState::Text { content }) = self.nodes.get_mut(node) {
                    content.apply(SequenceOp::Insert {
                        after: *after,
                        id: *id,
                        value: *ch,
                        right_origin: *right_origin,
                    });
                }
            }
            DocOp::DeleteText { id, node, target } => {
                if let Some(NodeState::Text { content }) = self.nodes.get_mut(node) {
                    content.delete(*target, *id);
                }
            }
            DocOp::SetKind { id, node, kind } => {
                if let Some(NodeState::Block { kind: register, .. }) = self.nodes.get_mut(node) {
                    register.set(kind.clone(), *id);
                }
            }
            DocOp::SetAttr {
                id,
                node,
                name,
                value,
            } => {
                if let Some(NodeState::Block { attrs, .. }) = self.nodes.get_mut(node) {
                    attrs.set(name.clone(), value.clone(), *id);
                }
            }
        }
    }

    // ---- materialization ----

    /// Render the replicated state as a document tree.
    pub fn to_tree(&self) -> DocumentTree {
        let mut blocks = Vec::new();
        for (_, key) in self.blocks.visible_entries() {
            let Some(NodeState::Block {
                kind,
                attrs,
                inlines,
            }) = self.nodes.get(key)
            else {
                continue;
            };
            let block_kind = match kind.get_ref().as_str() {
                "heading" => {
                    let level = attrs
                        .get(&"level".to_string())
                        .and_then(|raw| raw.parse::<u8>().ok())
                        .unwrap_or(1);
                    BlockKind::Heading { level }
                }
                _ => BlockKind::Paragraph,
            };

            let mut children = Vec::new();
            for (_, inline_key) in inlines.visible_entries() {
                let Some(NodeState::Text { content }) = self.nodes.get(inline_key) else {
                    continue;
                };
                children.push(InlineNode {
                    key: *inline_key,
                    text: content.iter().collect(),
                });
            }

            blocks.push(BlockNode {
                key: *key,
                kind: block_kind,
                children,
            });
        }
        DocumentTree { blocks }
    }

    /// Canonical JSON text of the current state.
    pub fn materialize(&self) -> String {
        self.to_tree().to_canonical_json()
    }
}

fn elem_of(seq: &Sequence<NodeKey>, key: NodeKey) -> Option<OpId> {
    seq.visible_entries()
        .find(|(_, value)| **value == key)
        .map(|(id, _)| id)
}

fn visible_anchor<T: Clone>(seq: &Sequence<T>, index: usize) -> Option<OpId> {
    if index == 0 {
        None
    } else {
        seq.visible_entries().nth(index - 1).map(|(id, _)| id)
    }
}
