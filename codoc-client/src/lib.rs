//! Editor-side synchronization client.
//!
//! An [`EditorSession`] holds one user's replica, live tree, and awareness
//! state, and translates between tree edits and wire messages without doing
//! any I/O. The [`Client`] drives a session over a [`Transport`], handling
//! reconnects and command dispatch.

pub mod awareness;
pub mod connection;
pub mod session;
pub mod transport;

pub use awareness::{resolve, AwarenessTracker, CursorPlacement};
pub use connection::{Client, ClientCommand, ClientError, Connector, ReconnectPolicy, WsConnector};
pub use session::{EditorSession, UserProfile};
pub use transport::{MockTransport, Transport, TransportError, WsTransport};
