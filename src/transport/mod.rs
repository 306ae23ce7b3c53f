//! Transport abstraction.
//!
//! The socket driver only needs a bidirectional text-frame connection. A
//! [`Transport`] opens one and hands back independent writer/reader halves so
//! the driver can await inbound frames inside `tokio::select!` while writing
//! from other branches.
//!
//! ```text
//!   Transport::connect(url)
//!         │
//!         ├── TransportWriter  send_text(), close()
//!         └── TransportReader  recv() → Inbound::Text | Inbound::Closed
//! ```
//!
//! [`websocket::WebSocketTransport`] is the production implementation.

pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

pub use websocket::WebSocketTransport;

/// Frame received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// UTF-8 text frame.
    Text(String),
    /// Peer closed the connection.
    Closed {
        /// Close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Writer/reader pair for one established connection.
pub type Connection = (Box<dyn TransportWriter>, Box<dyn TransportReader>);

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is refused or the handshake fails.
    async fn connect(&self, url: &Url) -> Result<Connection>;
}

/// Write half of a connection.
#[async_trait]
pub trait TransportWriter: Send {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait TransportReader: Send {
    /// Receive the next frame, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<Inbound>>;
}
