//! WebSocket front end for the relay hub.
//!
//! One task per connection. Each task owns the websocket, forwards inbound
//! binary frames to the hub, and drains its broadcast receiver back onto the
//! socket, skipping frames that originated from its own session.

use crate::hub::{RelayHub, SessionId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity (frames buffered per lagging session)
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(config.broadcast_capacity));
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!("new tcp connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(hub, stream, addr).await {
                    tracing::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    hub: Arc<RelayHub>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let session: SessionId = Uuid::new_v4();
    tracing::info!(%session, "websocket connection established from {addr}");

    let (snapshot, mut rx) = hub.connect(session).await?;
    ws_sender.send(Message::Binary(snapshot.into())).await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        hub.handle_frame(session, &data).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%session, "connection closed by {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        tracing::error!(%session, "websocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = rx.recv() => {
                match frame {
                    Ok((origin, data)) => {
                        // Never echo a session's own frames back
                        if origin != session {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Skipped frames cannot be resent; drop the
                        // connection so the client resyncs from a fresh
                        // snapshot on reconnect
                        tracing::warn!(%session, "lagged by {n} frames, closing for resync");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    hub.disconnect(session).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }
}
