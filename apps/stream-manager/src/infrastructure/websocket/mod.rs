//! WebSocket Transport
//!
//! `Transport` adapter over `tokio-tungstenite`. TLS is handled by rustls
//! with the webpki root store; the binary installs the crypto provider.
//!
//! Pings are answered inline and surfaced as `Inbound::Control` so idle
//! detection sees control traffic as liveness.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Inbound, Transport, TransportError, TransportSocket};

/// Opens one `tokio-tungstenite` socket per `connect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSocket>, TransportError> {
        tracing::debug!(url, "Opening WebSocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(WebSocketSocket { stream }))
    }
}

/// One open `tokio-tungstenite` socket.
struct WebSocketSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportSocket for WebSocketSocket {
    async fn next_frame(&mut self) -> Option<Result<Inbound, TransportError>> {
        match self.stream.next().await? {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(data)) => Some(Ok(Inbound::Binary(data.to_vec()))),
            Ok(Message::Ping(data)) => {
                if let Err(e) = self.stream.send(Message::Pong(data)).await {
                    return Some(Err(map_socket_error(e)));
                }
                Some(Ok(Inbound::Control))
            }
            Ok(Message::Pong(_) | Message::Frame(_)) => Some(Ok(Inbound::Control)),
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "Server sent close frame");
                None
            }
            Err(e) => Some(Err(map_socket_error(e))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::trace!(error = %e, "Close handshake failed");
        }
    }
}

fn map_socket_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Socket(other.to_string()),
    }
}
