//! Connection loop: drives an [`EditorSession`] over a [`Transport`].
//!
//! The loop multiplexes inbound frames with editor commands and reconnects
//! on transport failure, up to the configured number of attempts. Every
//! reconnect goes through the full sync handshake again, which is also what
//! flushes edits made while disconnected.

use crate::session::EditorSession;
use crate::transport::{Transport, TransportError, WsTransport};
use async_trait::async_trait;
use codoc_doc::{DocumentTree, NodeKey};
use codoc_sync::WireMessage;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("gave up after {attempts} connection attempts")]
    GaveUp { attempts: u32 },
}

/// Produces a fresh transport for each connection attempt.
#[async_trait]
pub trait Connector: Send {
    type Conn: Transport;

    async fn connect(&mut self) -> Result<Self::Conn, TransportError>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Conn = WsTransport;

    async fn connect(&mut self) -> Result<WsTransport, TransportError> {
        WsTransport::connect(&self.url).await
    }
}

/// Commands from the editor side.
pub enum ClientCommand {
    Edit(Box<dyn FnOnce(&mut DocumentTree) + Send>),
    Cursor { anchor: NodeKey, offset: usize },
    Shutdown,
}

pub struct Client<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    session: EditorSession,
}

impl<C: Connector> Client<C> {
    pub fn new(connector: C, policy: ReconnectPolicy, session: EditorSession) -> Self {
        Self {
            connector,
            policy,
            session,
        }
    }

    pub fn session(&self) -> &EditorSession {
        &self.session
    }

    /// Run until a shutdown command arrives or reconnection gives up.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Result<(), ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut conn = match self.connector.connect().await {
                Ok(conn) => {
                    tracing::info!("connected to relay");
                    attempt = 0;
                    conn
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "connection attempt failed");
                    if attempt >= self.policy.max_attempts {
                        return Err(ClientError::GaveUp { attempts: attempt });
                    }
                    tokio::time::sleep(self.policy.delay).await;
                    continue;
                }
            };

            if self.drive(&mut conn, &mut commands).await {
                conn.close().await;
                return Ok(());
            }
            tracing::warn!("connection lost, reconnecting");
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    /// Returns true on clean shutdown, false when the transport dropped.
    async fn drive(
        &mut self,
        conn: &mut C::Conn,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> bool {
        loop {
            tokio::select! {
                frame = conn.recv() => {
                    let Some(frame) = frame else {
                        return false;
                    };
                    let message = match WireMessage::decode(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping undecodable frame");
                            continue;
                        }
                    };
                    for reply in self.session.handle_message(message) {
                        if !send(conn, &reply).await {
                            return false;
                        }
                    }
                }

                command = commands.recv() => {
                    let outbound = match command {
                        Some(ClientCommand::Edit(f)) => self.session.edit(f),
                        Some(ClientCommand::Cursor { anchor, offset }) => {
                            self.session.cursor_moved(anchor, offset)
                        }
                        Some(ClientCommand::Shutdown) | None => return true,
                    };
                    if let Some(message) = outbound
                        && !send(conn, &message).await
                    {
                        return false;
                    }
                }
            }
        }
    }
}

async fn send<T: Transport>(conn: &mut T, message: &WireMessage) -> bool {
    let bytes = match message.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound message");
            return true;
        }
    };
    if let Err(e) = conn.send(bytes).await {
        tracing::warn!(error = %e, "send failed");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UserProfile;
    use crate::transport::MockTransport;
    use codoc_doc::default_document;
    use codoc_sync::Replica;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn profile() -> UserProfile {
        UserProfile {
            user_id: "u1".to_string(),
            user_name: "U1".to_string(),
            color: "blue".to_string(),
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            delay: Duration::ZERO,
        }
    }

    struct FailingConnector {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        type Conn = MockTransport;

        async fn connect(&mut self) -> Result<MockTransport, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect("refused".to_string()))
        }
    }

    struct QueueConnector {
        transports: VecDeque<MockTransport>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for QueueConnector {
        type Conn = MockTransport;

        async fn connect(&mut self) -> Result<MockTransport, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.transports
                .pop_front()
                .ok_or_else(|| TransportError::Connect("exhausted".to_string()))
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut client = Client::new(
            FailingConnector { calls: calls.clone() },
            fast_policy(),
            EditorSession::new(1, profile()),
        );
        let (_tx, rx) = mpsc::unbounded_channel();

        let result = client.run(rx).await;
        assert!(matches!(result, Err(ClientError::GaveUp { attempts: 5 })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_syncs_then_sends_edit() {
        let relay = Replica::from_tree(0, &default_document());
        let snapshot = WireMessage::SyncUpdate(relay.full_update().encode().unwrap())
            .encode()
            .unwrap();

        let (transport, inbound, mut outbound) = MockTransport::pair();
        inbound.send(snapshot).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let mut client = Client::new(
            QueueConnector {
                transports: VecDeque::from([transport]),
                calls,
            },
            fast_policy(),
            EditorSession::new(7, profile()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let result = client.run(rx).await;
            (client, result)
        });

        // Let the snapshot land before issuing the edit
        tokio::task::yield_now().await;
        tx.send(ClientCommand::Edit(Box::new(|tree| {
            tree.blocks[0].children[0].text.push('!');
        })))
        .unwrap();

        let frame = outbound.recv().await.unwrap();
        let WireMessage::Update(bytes) = WireMessage::decode(&frame).unwrap() else {
            panic!("expected an update frame");
        };
        let mut verify = relay.clone();
        verify.apply_update(&codoc_sync::Update::decode(&bytes).unwrap());
        assert_eq!(verify.to_tree().blocks[0].children[0].text, "hello!");

        tx.send(ClientCommand::Shutdown).unwrap();
        let (client, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert!(client.session().is_synced());
        drop(inbound);
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_drop() {
        let (first, first_inbound, _first_out) = MockTransport::pair();
        let (second, second_inbound, _second_out) = MockTransport::pair();
        // First connection is already dead when the client picks it up
        drop(first_inbound);

        let calls = Arc::new(AtomicU32::new(0));
        let mut client = Client::new(
            QueueConnector {
                transports: VecDeque::from([first, second]),
                calls: calls.clone(),
            },
            fast_policy(),
            EditorSession::new(1, profile()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { client.run(rx).await });

        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        tx.send(ClientCommand::Shutdown).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        drop(second_inbound);
    }
}
