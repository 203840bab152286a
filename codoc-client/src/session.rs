//! One user's editing session, free of any I/O.
//!
//! The session owns the replica, the live tree, and the awareness tracker.
//! Inbound wire messages go through [`EditorSession::handle_message`], which
//! may produce messages to send back; local edits go through
//! [`EditorSession::edit`]. Keeping the session synchronous makes the whole
//! protocol testable without a socket in sight.

use crate::awareness::AwarenessTracker;
use codoc_bridge::{apply_incremental, apply_snapshot_update, local_change, SyncContext};
use codoc_core::PeerId;
use codoc_doc::{clamp_grapheme_offset, DocumentTree, NodeKey};
use codoc_sync::{CursorRecord, Replica, Update, WireMessage};

/// Identity attached to this session's cursor broadcasts.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
}

pub struct EditorSession {
    profile: UserProfile,
    ctx: SyncContext,
    replica: Replica,
    tree: DocumentTree,
    awareness: AwarenessTracker,
    synced: bool,
}

impl EditorSession {
    pub fn new(peer: PeerId, profile: UserProfile) -> Self {
        Self {
            profile,
            ctx: SyncContext::new(),
            replica: Replica::new(peer),
            tree: DocumentTree::new(),
            awareness: AwarenessTracker::new(),
            synced: false,
        }
    }

    /// A session with a random nonzero peer id. Peer zero is reserved for
    /// the relay.
    pub fn with_random_peer(profile: UserProfile) -> Self {
        Self::new(rand::random::<u64>().max(1), profile)
    }

    pub fn tree(&self) -> &DocumentTree {
        &self.tree
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn materialize(&self) -> String {
        self.tree.to_canonical_json()
    }

    /// Process one message from the relay. Returns messages to send back,
    /// which is only nonempty after an initial sync that found local
    /// operations the relay has not seen.
    pub fn handle_message(&mut self, message: WireMessage) -> Vec<WireMessage> {
        match message {
            WireMessage::SyncUpdate(bytes) => self.handle_sync(&bytes),
            WireMessage::BroUpdate(bytes) => {
                if let Err(e) = apply_incremental(&self.ctx, &mut self.replica, &mut self.tree, &bytes) {
                    tracing::warn!(error = %e, "dropping malformed rebroadcast");
                }
                Vec::new()
            }
            WireMessage::CursorUpdate(record) => {
                if record.user_id != self.profile.user_id {
                    self.awareness.observe(record);
                }
                Vec::new()
            }
            WireMessage::Update(_) => {
                tracing::warn!("unexpected client-bound update, dropping");
                Vec::new()
            }
        }
    }

    /// Initial sync: replace local tree state with the relay's, then offer
    /// back everything the snapshot did not cover. After a reconnect this is
    /// what pushes edits made while offline.
    fn handle_sync(&mut self, bytes: &[u8]) -> Vec<WireMessage> {
        let update = match Update::decode(bytes) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed snapshot");
                return Vec::new();
            }
        };
        let snapshot_sv = update.state_vector();
        apply_snapshot_update(&self.ctx, &mut self.replica, &mut self.tree, &update);
        self.synced = true;

        // The log is the source of truth for what needs resending; any
        // half-drained outbox state is superseded here.
        let _ = self.replica.take_outbox();
        let backlog = self.replica.update_since(&snapshot_sv);
        if backlog.is_empty() {
            return Vec::new();
        }
        tracing::info!(ops = backlog.ops.len(), "resending operations after sync");
        match backlog.encode() {
            Ok(encoded) => vec![WireMessage::Update(encoded)],
            Err(e) => {
                tracing::error!(error = %e, "failed to encode backlog");
                Vec::new()
            }
        }
    }

    /// Apply a local edit to the tree and emit the resulting update, if any.
    /// Edits made inside a remote apply are dropped by the guard in
    /// [`local_change`].
    pub fn edit(&mut self, f: impl FnOnce(&mut DocumentTree)) -> Option<WireMessage> {
        f(&mut self.tree);
        let update = local_change(&self.ctx, &mut self.replica, &self.tree)?;
        match update.encode() {
            Ok(bytes) => Some(WireMessage::Update(bytes)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode local update");
                None
            }
        }
    }

    /// Build a cursor broadcast for a caret position in the given text node.
    /// Returns `None` when the node does not exist.
    pub fn cursor_moved(&self, anchor: NodeKey, offset: usize) -> Option<WireMessage> {
        let node = self.tree.find_text_node(anchor)?;
        Some(WireMessage::CursorUpdate(CursorRecord {
            user_id: self.profile.user_id.clone(),
            user_name: self.profile.user_name.clone(),
            anchor_key: anchor,
            anchor_offset: clamp_grapheme_offset(&node.text, offset) as u32,
            color: self.profile.color.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codoc_doc::{default_document, BlockNode, InlineNode};

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            user_id: id.to_string(),
            user_name: id.to_uppercase(),
            color: "crimson".to_string(),
        }
    }

    /// A relay collapsed to its essentials: an authoritative replica that
    /// merges updates and hands back the bytes to fan out.
    struct FakeRelay {
        replica: Replica,
    }

    impl FakeRelay {
        fn new() -> Self {
            Self {
                replica: Replica::from_tree(0, &default_document()),
            }
        }

        fn snapshot(&self) -> WireMessage {
            WireMessage::SyncUpdate(self.replica.full_update().encode().unwrap())
        }

        /// Merge a client update and return the rebroadcast frame.
        fn relay(&mut self, message: WireMessage) -> WireMessage {
            let WireMessage::Update(bytes) = message else {
                panic!("relay only accepts updates");
            };
            let update = Update::decode(&bytes).unwrap();
            self.replica.apply_update(&update);
            WireMessage::BroUpdate(bytes)
        }
    }

    #[test]
    fn test_initial_sync_yields_default_document() {
        let relay = FakeRelay::new();
        let mut session = EditorSession::new(1, profile("u1"));

        let replies = session.handle_message(relay.snapshot());
        assert!(replies.is_empty());
        assert!(session.is_synced());
        assert_eq!(session.tree().blocks[0].children[0].text, "hello");
    }

    #[test]
    fn test_edit_propagates_between_sessions() {
        let mut relay = FakeRelay::new();
        let mut a = EditorSession::new(1, profile("alice"));
        let mut b = EditorSession::new(2, profile("bob"));
        a.handle_message(relay.snapshot());
        b.handle_message(relay.snapshot());

        let update = a
            .edit(|tree| tree.blocks[0].children[0].text.push_str(" world"))
            .unwrap();
        let rebroadcast = relay.relay(update);
        b.handle_message(rebroadcast);

        assert_eq!(b.tree().blocks[0].children[0].text, "hello world");
        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.materialize(), relay.replica.materialize());
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut relay = FakeRelay::new();
        let mut a = EditorSession::new(1, profile("alice"));
        let mut b = EditorSession::new(2, profile("bob"));
        a.handle_message(relay.snapshot());
        b.handle_message(relay.snapshot());

        let from_a = a.edit(|tree| tree.blocks[0].children[0].text.insert(0, '>')).unwrap();
        let from_b = b
            .edit(|tree| {
                tree.blocks.push(BlockNode::heading(1, vec![InlineNode::new("notes")]));
            })
            .unwrap();

        b.handle_message(relay.relay(from_a));
        a.handle_message(relay.relay(from_b));

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.tree().blocks[0].children[0].text, ">hello");
        assert_eq!(a.tree().blocks[1].children[0].text, "notes");
    }

    #[test]
    fn test_rebroadcast_does_not_echo_back_out() {
        let mut relay = FakeRelay::new();
        let mut a = EditorSession::new(1, profile("alice"));
        let mut b = EditorSession::new(2, profile("bob"));
        a.handle_message(relay.snapshot());
        b.handle_message(relay.snapshot());

        let update = a.edit(|tree| tree.blocks[0].children[0].text.push('!')).unwrap();
        b.handle_message(relay.relay(update));

        // Nothing changed from b's point of view, so an edit pass that
        // touches nothing must stay silent.
        assert!(b.edit(|_| {}).is_none());
    }

    #[test]
    fn test_offline_edits_resent_on_resync() {
        let mut relay = FakeRelay::new();
        let mut session = EditorSession::new(1, profile("alice"));
        session.handle_message(relay.snapshot());

        // Connection drops; these updates never reach the relay
        let _lost = session.edit(|tree| tree.blocks[0].children[0].text.push_str(", offline"));
        assert_eq!(relay.replica.to_tree().blocks[0].children[0].text, "hello");

        // Reconnect: the fresh snapshot triggers a backlog reply
        let replies = session.handle_message(relay.snapshot());
        assert_eq!(replies.len(), 1);
        relay.relay(replies.into_iter().next().unwrap());

        assert_eq!(
            relay.replica.to_tree().blocks[0].children[0].text,
            "hello, offline"
        );
        assert_eq!(session.materialize(), relay.replica.materialize());
    }

    #[test]
    fn test_resync_merges_remote_changes_made_while_offline() {
        let mut relay = FakeRelay::new();
        let mut a = EditorSession::new(1, profile("alice"));
        let mut b = EditorSession::new(2, profile("bob"));
        a.handle_message(relay.snapshot());
        b.handle_message(relay.snapshot());

        // a goes offline and edits; b keeps editing through the relay
        let _lost = a.edit(|tree| tree.blocks[0].children[0].text.push('A'));
        let from_b = b.edit(|tree| tree.blocks[0].children[0].text.insert(0, 'B')).unwrap();
        relay.relay(from_b);

        let replies = a.handle_message(relay.snapshot());
        assert_eq!(replies.len(), 1);
        relay.relay(replies.into_iter().next().unwrap());

        assert_eq!(a.materialize(), relay.replica.materialize());
        assert_eq!(a.tree().blocks[0].children[0].text, "BhelloA");
    }

    #[test]
    fn test_malformed_snapshot_leaves_session_unsynced() {
        let mut session = EditorSession::new(1, profile("u1"));
        let before = session.materialize();

        let replies = session.handle_message(WireMessage::SyncUpdate(vec![0xFF, 0x00, 0x42]));
        assert!(replies.is_empty());
        assert!(!session.is_synced());
        assert_eq!(session.materialize(), before);
    }

    #[test]
    fn test_malformed_rebroadcast_is_dropped() {
        let relay = FakeRelay::new();
        let mut session = EditorSession::new(1, profile("u1"));
        session.handle_message(relay.snapshot());
        let before = session.materialize();

        let replies = session.handle_message(WireMessage::BroUpdate(vec![0xBA, 0xD0]));
        assert!(replies.is_empty());
        assert_eq!(session.materialize(), before);
    }

    #[test]
    fn test_cursor_updates_tracked_per_user() {
        let relay = FakeRelay::new();
        let mut session = EditorSession::new(1, profile("alice"));
        session.handle_message(relay.snapshot());
        let anchor = session.tree().blocks[0].children[0].key;

        let remote = CursorRecord {
            user_id: "bob".to_string(),
            user_name: "Bob".to_string(),
            anchor_key: anchor,
            anchor_offset: 2,
            color: "green".to_string(),
        };
        session.handle_message(WireMessage::CursorUpdate(remote));
        assert_eq!(session.awareness().len(), 1);

        // The session's own record coming back must not be tracked
        let own = session.cursor_moved(anchor, 1).unwrap();
        session.handle_message(own);
        assert_eq!(session.awareness().len(), 1);
    }

    #[test]
    fn test_cursor_moved_clamps_offset() {
        let relay = FakeRelay::new();
        let mut session = EditorSession::new(1, profile("alice"));
        session.handle_message(relay.snapshot());
        let anchor = session.tree().blocks[0].children[0].key;

        let Some(WireMessage::CursorUpdate(record)) = session.cursor_moved(anchor, 99) else {
            panic!("expected a cursor update");
        };
        assert_eq!(record.anchor_offset, 5);
        assert_eq!(record.user_id, "alice");
    }

    #[test]
    fn test_cursor_moved_for_missing_node_is_none() {
        let session = EditorSession::new(1, profile("alice"));
        let orphan = InlineNode::new("").key;
        assert!(session.cursor_moved(orphan, 0).is_none());
    }
}
