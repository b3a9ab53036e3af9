use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("websocket handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthenticationRejected(_))
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame decode failed: {0}")]
    DecodeFailed(String),

    #[error("frame encode failed: {0}")]
    EncodeFailed(String),

    #[error("frame is not valid UTF-8")]
    NotUtf8,
}
