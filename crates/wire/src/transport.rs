use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    /// Reported in connection lifecycle events; the handshake itself does
    /// not authenticate.
    pub user_id: String,
    pub timeout_seconds: u64,
    /// 0 means retry forever.
    pub max_reconnect_attempts: u32,
}

/// Transport abstraction over the realtime wire.
///
/// `WebSocketTransport` is the production implementation; tests substitute
/// in-memory fakes to drive the connection manager deterministically.
pub trait WireTransport: Send + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

const MIN_TIMEOUT_SECONDS: u64 = 1;

fn connect_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(config.timeout_seconds.max(MIN_TIMEOUT_SECONDS))
}

fn map_handshake_error(error: WsError) -> ConnectionError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            let message = format!("server returned {status}");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ConnectionError::AuthenticationRejected(message)
            } else {
                ConnectionError::HandshakeRejected(message)
            }
        }
        WsError::Tls(error) => ConnectionError::TlsHandshakeFailed(error.to_string()),
        other => map_websocket_error(other),
    }
}

fn map_websocket_error(error: WsError) -> ConnectionError {
    if matches!(error, WsError::ConnectionClosed | WsError::AlreadyClosed) {
        return ConnectionError::ConnectionClosed("websocket closed".to_string());
    }

    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns")
        || lower.contains("resolve")
        || lower.contains("unable to connect")
        || lower.contains("failed to lookup")
    {
        ConnectionError::DnsResolutionFailed(message)
    } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
    {
        ConnectionError::TlsHandshakeFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    io_timeout: Duration,
}

impl WireTransport for WebSocketTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let io_timeout = connect_timeout(config);

        let (stream, _response) =
            timeout(io_timeout, tokio_tungstenite::connect_async(&config.url))
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(map_handshake_error)?;

        Ok(Self { stream, io_timeout })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }

        let text = std::str::from_utf8(data).map_err(|error| {
            ConnectionError::TransportError(format!(
                "wire frames must be UTF-8 text; invalid payload: {error}"
            ))
        })?;
        let message = WsMessage::text(text.to_string());

        timeout(self.io_timeout, self.stream.send(message))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_websocket_error)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            let message = match self.stream.next().await {
                Some(result) => result.map_err(map_websocket_error)?,
                None => {
                    return Err(ConnectionError::ConnectionClosed(
                        "websocket stream ended".to_string(),
                    ));
                }
            };

            match message {
                WsMessage::Text(text) => return Ok(text.to_string().into_bytes()),
                WsMessage::Binary(bytes) => return Ok(bytes.to_vec()),
                WsMessage::Close(_) => {
                    return Err(ConnectionError::ConnectionClosed(
                        "websocket closed by peer".to_string(),
                    ));
                }
                // Pongs are queued automatically by tungstenite.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match timeout(self.io_timeout, self.stream.close(None)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(()),
            Ok(Err(error)) => Err(map_websocket_error(error)),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }
}
