use std::sync::Arc;
use std::time::Duration;

pub use crate::transport::ConnectionConfig;
use crate::{
    error::ConnectionError,
    transport::{WebSocketTransport, WireTransport},
};

use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};

const COMPONENT: &str = "connection";

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Owns the transport and drives the connect/retry state machine.
///
/// Retryable failures back off exponentially; authentication rejections
/// surface immediately. Lifecycle transitions are published on
/// `system.connection.*` so trackers can re-announce and re-join after
/// every successful reconnect.
pub struct ConnectionManager<T = WebSocketTransport>
where
    T: WireTransport,
{
    state: ConnectionState,
    config: ConnectionConfig,
    transport: Option<T>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<T> ConnectionManager<T>
where
    T: WireTransport,
{
    const INITIAL_RECONNECT_DELAY_SECONDS: u64 = 1;
    const MAX_RECONNECT_DELAY_SECONDS: u64 = 60;

    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            transport: None,
            event_bus: None,
        }
    }

    pub fn with_event_bus(config: ConnectionConfig, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            transport: None,
            event_bus: Some(event_bus),
        }
    }

    /// Connect, retrying with backoff until connected or retries are
    /// exhausted. Calling while already connected is a no-op.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Connected) && self.transport.is_some() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let mut reconnect_attempt = 0_u32;

        loop {
            match T::connect(&self.config).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.state = ConnectionState::Connected;
                    self.emit_connection_established();
                    return Ok(());
                }
                Err(error) => {
                    reconnect_attempt = self
                        .handle_connect_failure(error, reconnect_attempt)
                        .await?;
                }
            }
        }
    }

    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            ConnectionError::TransportError("cannot send a frame while disconnected".to_string())
        })?;
        transport.send(frame).await
    }

    /// Receive the next frame, returning `Ok(None)` if nothing arrives
    /// within the timeout or no transport is attached.
    pub async fn recv_frame_with_timeout(
        &mut self,
        timeout_duration: Duration,
    ) -> Result<Option<Vec<u8>>, ConnectionError> {
        let Some(transport) = self.transport.as_mut() else {
            // Pace callers that poll in a loop while no transport is up.
            tokio::time::sleep(timeout_duration).await;
            return Ok(None);
        };

        match tokio::time::timeout(timeout_duration, transport.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Tear down the broken transport and run the normal connect path,
    /// backoff included.
    pub async fn recover_after_network_interruption(
        &mut self,
        reason: String,
    ) -> Result<(), ConnectionError> {
        let will_retry = self.should_retry(1);

        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }

        self.state = ConnectionState::Disconnected;
        self.emit_connection_lost(reason, will_retry);

        self.connect().await
    }

    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                self.state = ConnectionState::Disconnected;
                self.emit_connection_lost(error.to_string(), false);
                self.emit_connection_error(&error);
                return Err(error);
            }
        }

        if !matches!(self.state, ConnectionState::Disconnected) {
            self.emit_connection_lost("user requested disconnect".to_string(), false);
        }

        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    async fn handle_connect_failure(
        &mut self,
        error: ConnectionError,
        reconnect_attempt: u32,
    ) -> Result<u32, ConnectionError> {
        self.transport = None;
        let next_attempt = reconnect_attempt.saturating_add(1);
        let will_retry = error.is_retryable() && self.should_retry(next_attempt);

        self.emit_connection_lost(error.to_string(), will_retry);
        self.emit_connection_error(&error);

        if !will_retry {
            self.state = ConnectionState::Disconnected;
            return Err(error);
        }

        self.state = ConnectionState::Reconnecting {
            attempt: next_attempt,
        };
        self.emit_connection_reconnecting(next_attempt);

        tokio::time::sleep(Self::reconnect_delay(next_attempt)).await;
        self.state = ConnectionState::Connecting;
        Ok(next_attempt)
    }

    fn should_retry(&self, attempt: u32) -> bool {
        self.config.max_reconnect_attempts == 0 || attempt <= self.config.max_reconnect_attempts
    }

    fn reconnect_delay(attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let seconds = 1_u64.checked_shl(shift).unwrap_or(u64::MAX).clamp(
            Self::INITIAL_RECONNECT_DELAY_SECONDS,
            Self::MAX_RECONNECT_DELAY_SECONDS,
        );
        Duration::from_secs(seconds)
    }

    fn emit_connection_established(&self) {
        self.emit_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                user_id: self.config.user_id.clone(),
            },
        );
    }

    fn emit_connection_lost(&self, reason: String, will_retry: bool) {
        self.emit_event(
            "system.connection.lost",
            EventPayload::ConnectionLost { reason, will_retry },
        );
    }

    fn emit_connection_reconnecting(&self, attempt: u32) {
        self.emit_event(
            "system.connection.reconnecting",
            EventPayload::ConnectionReconnecting { attempt },
        );
    }

    fn emit_connection_error(&self, error: &ConnectionError) {
        self.emit_event(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: COMPONENT.to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
    }

    fn emit_event(&self, channel_name: &str, payload: EventPayload) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };

        let Ok(channel) = Channel::new(channel_name) else {
            return;
        };

        let event = Event::new(channel, EventSource::System(COMPONENT.to_string()), payload);
        let _ = event_bus.publish(event);
    }
}
