//! Reconciliation between the editable tree and the replicated state.
//!
//! Two directions:
//!
//! - Outbound: [`local_change`] diffs the live tree against the replica,
//!   pushes the difference into the replica as operations, and returns the
//!   resulting [`Update`] for the transport.
//! - Inbound: [`apply_snapshot`] and [`apply_incremental`] merge remote bytes
//!   into the replica and patch the live tree to match, node by node, keyed
//!   by stable node identity.
//!
//! A [`SyncContext`] guards against echo loops: while a remote update is
//! being applied to the tree, [`local_change`] refuses to emit, so a patch
//! can never bounce back out as a fresh local edit.

use codoc_doc::{default_document, BlockNode, DocumentTree, InlineNode, NodeKey};
use codoc_sync::{DecodeError, Replica, Update};
use std::cell::Cell;
use std::collections::BTreeSet;

/// Tracks whether the current tree mutation originates from a remote update.
///
/// The flag is scoped: it is only set for the duration of the closure passed
/// to [`SyncContext::remote`], and nests safely.
#[derive(Debug, Default)]
pub struct SyncContext {
    applying_remote: Cell<bool>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.get()
    }

    /// Run `f` with the remote-apply flag set, restoring it afterwards.
    pub fn remote<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = self.applying_remote.replace(true);
        let out = f();
        self.applying_remote.set(prev);
        out
    }
}

/// Push local tree edits into the replica.
///
/// Returns `None` when a remote update is being applied or when the tree
/// already matches the replicated state; otherwise the drained outbox.
pub fn local_change(
    ctx: &SyncContext,
    replica: &mut Replica,
    tree: &DocumentTree,
) -> Option<Update> {
    if ctx.is_applying_remote() {
        return None;
    }
    if replica.materialize() == tree.to_canonical_json() {
        return None;
    }

    diff_into_replica(replica, tree);
    let update = replica.take_outbox();
    if update.is_empty() { None } else { Some(update) }
}

/// Apply an initial full-state update and replace the live tree wholesale.
///
/// An empty replicated document falls back to the default document; the
/// fallback content is written back into the replica so it syncs out like
/// any local edit.
pub fn apply_snapshot(
    ctx: &SyncContext,
    replica: &mut Replica,
    tree: &mut DocumentTree,
    bytes: &[u8],
) -> Result<(), DecodeError> {
    let update = Update::decode(bytes)?;
    apply_snapshot_update(ctx, replica, tree, &update);
    Ok(())
}

/// [`apply_snapshot`] for an already decoded update, so callers that need
/// the update for other bookkeeping decode only once.
pub fn apply_snapshot_update(
    ctx: &SyncContext,
    replica: &mut Replica,
    tree: &mut DocumentTree,
    update: &Update,
) {
    replica.apply_update(update);

    let target = replica.to_tree();
    let empty = target.is_empty();
    ctx.remote(|| {
        if empty {
            *tree = default_document();
        } else {
            *tree = target;
        }
    });

    if empty {
        tracing::debug!("snapshot was empty, seeding default document");
        diff_into_replica(replica, tree);
    }
}

/// Merge an incremental update and patch the live tree node by node.
///
/// Nodes are matched by key first, then by position and type; unmatched
/// target nodes are appended and live nodes whose keys left the replica are
/// removed. Decode failure skips the patch for this update only.
pub fn apply_incremental(
    ctx: &SyncContext,
    replica: &mut Replica,
    tree: &mut DocumentTree,
    bytes: &[u8],
) -> Result<(), DecodeError> {
    let update = Update::decode(bytes)?;
    replica.apply_update(&update);

    let target = replica.to_tree();
    ctx.remote(|| patch_tree(tree, &target));
    Ok(())
}

// ---- outbound diff ----

fn diff_into_replica(replica: &mut Replica, tree: &DocumentTree) {
    let current = replica.to_tree();
    let tree_keys: BTreeSet<NodeKey> = tree.blocks.iter().map(|b| b.key).collect();

    for block in &current.blocks {
        if !tree_keys.contains(&block.key) {
            replica.remove_block(block.key);
        }
    }

    for (idx, block) in tree.blocks.iter().enumerate() {
        match current.blocks.iter().find(|b| b.key == block.key) {
            None => {
                replica.insert_block(idx, block.key, block.kind);
                for (inline_idx, inline) in block.children.iter().enumerate() {
                    replica.insert_inline(block.key, inline_idx, inline.key);
                    for (ch_idx, ch) in inline.text.chars().enumerate() {
                        replica.insert_text(inline.key, ch_idx, ch);
                    }
                }
            }
            Some(existing) => {
                if existing.kind != block.kind {
                    replica.set_kind(block.key, block.kind.type_name());
                    if let codoc_doc::BlockKind::Heading { level } = block.kind {
                        replica.set_attr(block.key, "level", &level.to_string());
                    }
                }
                diff_children(replica, block, &existing.children);
            }
        }
    }
}

fn diff_children(replica: &mut Replica, block: &BlockNode, current: &[InlineNode]) {
    let tree_keys: BTreeSet<NodeKey> = block.children.iter().map(|i| i.key).collect();
    for inline in current {
        if !tree_keys.contains(&inline.key) {
            replica.remove_inline(block.key, inline.key);
        }
    }

    for (idx, inline) in block.children.iter().enumerate() {
        match current.iter().find(|i| i.key == inline.key) {
            None => {
                replica.insert_inline(block.key, idx, inline.key);
                for (ch_idx, ch) in inline.text.chars().enumerate() {
                    replica.insert_text(inline.key, ch_idx, ch);
                }
            }
            Some(existing) => {
                if existing.text != inline.text {
                    diff_text(replica, inline.key, &existing.text, &inline.text);
                }
            }
        }
    }
}

/// Minimal edit between two strings: shared prefix and suffix stay put, the
/// middle is replaced as a delete run followed by an insert run. Keeping the
/// runs contiguous avoids interleaving with concurrent edits elsewhere in
/// the node.
fn diff_text(replica: &mut Replica, node: NodeKey, old: &str, new: &str) {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    for _ in 0..(old.len() - prefix - suffix) {
        replica.delete_text(node, prefix);
    }
    for (i, ch) in new[prefix..new.len() - suffix].iter().enumerate() {
        replica.insert_text(node, prefix + i, *ch);
    }
}

// ---- inbound patch ----

fn patch_tree(live: &mut DocumentTree, target: &DocumentTree) {
    let mut remaining = std::mem::take(&mut live.blocks);
    let live_len = remaining.len();
    let mut out = Vec::with_capacity(target.blocks.len());

    for (idx, target_block) in target.blocks.iter().enumerate() {
        let matched = remaining
            .iter()
            .position(|b| b.key == target_block.key)
            .or_else(|| {
                // position+type fallback for live nodes the replica does
                // not know; earlier key matches shrank `remaining`, so the
                // target index has to be realigned first
                let aligned = idx.checked_sub(live_len - remaining.len())?;
                remaining
                    .get(aligned)
                    .filter(|b| {
                        b.kind.same_type(&target_block.kind)
                            && !target.blocks.iter().any(|t| t.key == b.key)
                    })
                    .map(|_| aligned)
            });

        match matched {
            Some(pos) => {
                let mut node = remaining.remove(pos);
                node.key = target_block.key;
                node.kind = target_block.kind;
                patch_children(&mut node.children, &target_block.children);
                out.push(node);
            }
            None => {
                tracing::debug!(key = %target_block.key, "no matching live node, appending");
                out.push(target_block.clone());
            }
        }
    }

    for gone in &remaining {
        tracing::debug!(key = %gone.key, "dropping live node absent from replica");
    }
    live.blocks = out;
}

fn patch_children(live: &mut Vec<InlineNode>, target: &[InlineNode]) {
    let mut remaining = std::mem::take(live);
    let live_len = remaining.len();

    for (idx, target_inline) in target.iter().enumerate() {
        let matched = remaining
            .iter()
            .position(|i| i.key == target_inline.key)
            .or_else(|| {
                let aligned = idx.checked_sub(live_len - remaining.len())?;
                remaining
                    .get(aligned)
                    .filter(|i| !target.iter().any(|t| t.key == i.key))
                    .map(|_| aligned)
            });

        match matched {
            Some(pos) => {
                let mut node = remaining.remove(pos);
                node.key = target_inline.key;
                node.text = target_inline.text.clone();
                live.push(node);
            }
            None => live.push(target_inline.clone()),
        }
    }
}
