//! Transport abstraction for the sync agent's event channel.
//!
//! The agent never talks to a socket directly; it drives a `SyncTransport`.
//! Production code uses `TokioTransport` (tokio-tungstenite). Tests use an
//! in-memory transport so batching and reconnection behavior can be
//! exercised without a network.

use thiserror::Error;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A received WebSocket message, decoupled from the tungstenite types.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// A bidirectional message channel to the server.
///
/// Implementations must deliver sends in call order (per-connection FIFO);
/// the relay's ordering guarantee depends on it.
#[async_trait::async_trait]
pub trait SyncTransport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a ping frame (keepalive).
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Receive the next message. `None` means the peer closed the channel.
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    /// Close the channel gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for transports, so the agent's reconnect loop can dial fresh
/// connections without knowing the concrete type.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    type Transport: SyncTransport;

    async fn connect(&self, url: &str) -> Result<Self::Transport, TransportError>;
}
