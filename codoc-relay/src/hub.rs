//! The relay hub: authoritative replica plus fan-out.
//!
//! The hub is transport-agnostic so the whole relay behavior can be tested
//! without sockets. Fan-out uses a tokio broadcast channel of pre-encoded
//! frames tagged with the originating session; receivers drop their own
//! frames, so a sender never sees its update echoed back.

use codoc_doc::default_document;
use codoc_sync::{
    validate_update, EncodeError, Replica, Update, ValidationLimits, WireMessage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Frames carried on the fan-out channel: originating session plus encoded
/// wire message.
pub type Frame = (SessionId, Arc<Vec<u8>>);

/// Peer id reserved for the relay's own seed operations.
const RELAY_PEER: u64 = 0;

/// Per-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, snapshot not yet sent
    Connecting,
    /// Snapshot delivered, session is live
    Synced,
    /// An update from this session is being merged and fanned out
    Relaying,
    /// Live and waiting for traffic
    Idle,
    /// Session is gone; terminal
    Disconnected,
}

/// Counters for monitoring relay health.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub updates_relayed: u64,
    pub updates_dropped: u64,
    pub cursor_updates: u64,
    pub active_sessions: usize,
}

struct AtomicRelayStats {
    updates_relayed: AtomicU64,
    updates_dropped: AtomicU64,
    cursor_updates: AtomicU64,
}

pub struct RelayHub {
    replica: Mutex<Replica>,
    limits: ValidationLimits,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
    tx: broadcast::Sender<Frame>,
    stats: AtomicRelayStats,
}

impl RelayHub {
    /// Create a hub whose replica is seeded with the default document, so
    /// the first client to ever connect sees a single "hello" paragraph.
    pub fn new(broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            replica: Mutex::new(Replica::from_tree(RELAY_PEER, &default_document())),
            limits: ValidationLimits::default(),
            sessions: RwLock::new(HashMap::new()),
            tx,
            stats: AtomicRelayStats {
                updates_relayed: AtomicU64::new(0),
                updates_dropped: AtomicU64::new(0),
                cursor_updates: AtomicU64::new(0),
            },
        }
    }

    /// Register a session and produce its initial sync frame.
    ///
    /// Returns the encoded [`WireMessage::SyncUpdate`] carrying the full
    /// document state, and the receiver for rebroadcast frames.
    pub async fn connect(
        &self,
        session: SessionId,
    ) -> Result<(Vec<u8>, broadcast::Receiver<Frame>), EncodeError> {
        self.set_state(session, SessionState::Connecting).await;

        // Subscribe before reading the replica. An update merged after the
        // snapshot is encoded then arrives as a duplicate frame, which
        // apply_update absorbs; subscribing after would lose it outright.
        let rx = self.tx.subscribe();
        let full = {
            let replica = self.replica.lock().await;
            replica.full_update()
        };
        let frame = WireMessage::SyncUpdate(full.encode()?).encode()?;

        self.set_state(session, SessionState::Synced).await;
        tracing::info!(%session, "session synced");
        Ok((frame, rx))
    }

    /// Handle one inbound binary frame from a session.
    ///
    /// Malformed frames and malformed deltas are logged and dropped; they
    /// are never forwarded and never touch the replica.
    pub async fn handle_frame(&self, session: SessionId, bytes: &[u8]) {
        let message = match WireMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%session, error = %e, "undecodable frame, dropping");
                self.stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match message {
            WireMessage::Update(delta) => self.handle_update(session, delta).await,
            WireMessage::CursorUpdate(record) => {
                self.stats.cursor_updates.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%session, user = %record.user_id, "cursor update");
                self.rebroadcast(session, &WireMessage::CursorUpdate(record));
            }
            WireMessage::SyncUpdate(_) | WireMessage::BroUpdate(_) => {
                tracing::warn!(%session, "unexpected relay-bound message type, dropping");
            }
        }
    }

    async fn handle_update(&self, session: SessionId, delta: Vec<u8>) {
        self.set_state(session, SessionState::Relaying).await;

        let update = match Update::decode(&delta) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(%session, error = %e, "malformed delta, dropping");
                self.stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
                self.set_state(session, SessionState::Idle).await;
                return;
            }
        };

        {
            let mut replica = self.replica.lock().await;
            if let Err(e) = validate_update(&update, &self.limits, replica.pending_count()) {
                tracing::warn!(%session, error = %e, "update rejected by validation");
                self.stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
                self.set_state(session, SessionState::Idle).await;
                return;
            }
            let result = replica.apply_update(&update);
            tracing::debug!(
                %session,
                applied = result.applied.len(),
                buffered = result.buffered.len(),
                "merged update"
            );
        }

        // Fan out the exact bytes the sender produced
        self.rebroadcast(session, &WireMessage::BroUpdate(delta));
        self.stats.updates_relayed.fetch_add(1, Ordering::Relaxed);
        self.set_state(session, SessionState::Idle).await;
    }

    pub async fn disconnect(&self, session: SessionId) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&session).is_some() {
            tracing::info!(%session, "session disconnected");
        }
    }

    fn rebroadcast(&self, origin: SessionId, message: &WireMessage) {
        match message.encode() {
            Ok(frame) => {
                // send() only fails with zero receivers; that is fine
                let _ = self.tx.send((origin, Arc::new(frame)));
            }
            Err(e) => tracing::error!(error = %e, "failed to encode rebroadcast frame"),
        }
    }

    async fn set_state(&self, session: SessionId, state: SessionState) {
        let mut sessions = self.sessions.write().await;
        let prev = sessions.insert(session, state);
        if prev != Some(state) {
            tracing::debug!(%session, ?prev, ?state, "session state");
        }
    }

    pub async fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.sessions.read().await.get(&session).copied()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Canonical JSON of the authoritative replica.
    pub async fn materialize(&self) -> String {
        self.replica.lock().await.materialize()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            updates_relayed: self.stats.updates_relayed.load(Ordering::Relaxed),
            updates_dropped: self.stats.updates_dropped.load(Ordering::Relaxed),
            cursor_updates: self.stats.cursor_updates.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }
}
