//! WebSocket transport backed by tokio-tungstenite.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::transport::{SyncTransport, TransportConnector, TransportError, WsMessage};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials tokio-tungstenite connections; the agent's reconnect loop calls
/// this once per session.
pub struct TokioConnector;

#[async_trait::async_trait]
impl TransportConnector for TokioConnector {
    type Transport = TokioTransport;

    async fn connect(&self, url: &str) -> Result<TokioTransport, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(TokioTransport { ws })
    }
}

/// A live WebSocket connection obtained from [`TokioConnector`].
pub struct TokioTransport {
    ws: WsStream,
}

impl TokioTransport {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.ws
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SyncTransport for TokioTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text.into())).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.send(Message::Ping(vec![].into())).await
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(msg) => {
                    if let Some(mapped) = map_message(msg) {
                        return Some(Ok(mapped));
                    }
                }
                Err(e) => return Some(Err(TransportError::Other(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Lift a tungstenite message into the transport-neutral type. Raw frames
/// only appear with custom socket flags and are skipped.
fn map_message(msg: Message) -> Option<WsMessage> {
    Some(match msg {
        Message::Text(text) => WsMessage::Text(text.to_string()),
        Message::Binary(data) => WsMessage::Binary(data.to_vec()),
        Message::Ping(data) => WsMessage::Ping(data.to_vec()),
        Message::Pong(data) => WsMessage::Pong(data.to_vec()),
        Message::Close(_) => WsMessage::Close,
        Message::Frame(_) => return None,
    })
}
