//! Transport abstraction over the relay connection.
//!
//! The client only ever exchanges binary frames, so the trait is a thin
//! send/recv pair. [`WsTransport`] is the production implementation;
//! [`MockTransport`] backs tests with in-memory channels.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound binary frame. `None` means the peer closed the
    /// connection.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    async fn close(&mut self);
}

/// Websocket transport over tokio-tungstenite.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (inner, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(data.to_vec()),
                Ok(Message::Close(_)) | Err(_) => return None,
                // Pings are answered by the library; text and pongs are noise
                _ => continue,
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// In-memory transport for tests. Frames sent by the client land on the
/// outbound receiver; frames pushed into the inbound sender show up in
/// `recv`.
pub struct MockTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockTransport {
    /// Returns the transport plus the test-side handles: a sender that
    /// injects inbound frames and a receiver that observes outbound frames.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            inbound_tx,
            outbound_rx,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
