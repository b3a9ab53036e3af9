use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use natter_core::event::{Event, EventBus, EventPayload};

use crate::frame::ClientFrame;

pub type FrameSender = mpsc::Sender<Vec<u8>>;

pub type FrameReceiver = mpsc::Receiver<Vec<u8>>;

pub fn frame_channel(buffer: usize) -> (FrameSender, FrameReceiver) {
    mpsc::channel(buffer)
}

/// Subscribes to `ui.**` command events and encodes them into wire frames
/// for the outbound pump.
pub struct OutboundRouter {
    event_bus: Arc<dyn EventBus>,
    frame_sender: FrameSender,
}

impl OutboundRouter {
    pub fn new(event_bus: Arc<dyn EventBus>, frame_sender: FrameSender) -> Self {
        Self {
            event_bus,
            frame_sender,
        }
    }

    pub async fn run(&self) -> Result<(), OutboundRouterError> {
        let mut subscription = self
            .event_bus
            .subscribe("ui.**")
            .map_err(|e| OutboundRouterError::SubscriptionFailed(e.to_string()))?;

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_event(&event).await {
                        warn!(
                            channel = %event.channel,
                            error = %e,
                            "failed to handle outbound event"
                        );
                    }
                }
                Err(natter_core::error::EventBusError::ChannelClosed) => {
                    debug!("event bus closed, outbound router stopping");
                    return Ok(());
                }
                Err(natter_core::error::EventBusError::Lagged(count)) => {
                    warn!(count, "outbound router lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "outbound router subscription error");
                    return Err(OutboundRouterError::SubscriptionFailed(e.to_string()));
                }
            }
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<(), OutboundRouterError> {
        let Some(frame) = frame_for_payload(&event.payload) else {
            return Ok(());
        };

        let bytes = frame
            .to_bytes()
            .map_err(|e| OutboundRouterError::EncodeFailed(e.to_string()))?;

        self.frame_sender
            .send(bytes)
            .await
            .map_err(|_| OutboundRouterError::WireSendFailed)?;

        Ok(())
    }
}

fn frame_for_payload(payload: &EventPayload) -> Option<ClientFrame> {
    match payload {
        EventPayload::OnlineAnnounceRequested {
            user_id,
            company_id,
        } => Some(ClientFrame::AnnounceOnline {
            user_id: user_id.clone(),
            company_id: company_id.clone(),
        }),
        EventPayload::ViewingChatRequested { user_id } => Some(ClientFrame::ViewingChat {
            user_id: user_id.clone(),
        }),
        EventPayload::LeftChatRequested { user_id } => Some(ClientFrame::LeftChat {
            user_id: user_id.clone(),
        }),
        EventPayload::RoomJoinRequested { conversation_id } => {
            Some(ClientFrame::JoinRoom(conversation_id.clone()))
        }
        EventPayload::RoomLeaveRequested { conversation_id } => {
            Some(ClientFrame::LeaveRoom(conversation_id.clone()))
        }
        EventPayload::TypingStartRequested {
            conversation_id,
            user_id,
            display_name,
        } => Some(ClientFrame::Typing {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
            display_name: display_name.clone(),
        }),
        EventPayload::TypingStopRequested {
            conversation_id,
            user_id,
            display_name,
        } => Some(ClientFrame::StopTyping {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
            display_name: display_name.clone(),
        }),
        EventPayload::MessageBroadcastRequested {
            conversation_id,
            message,
        } => Some(ClientFrame::BroadcastNewMessage {
            conversation_id: conversation_id.clone(),
            message: message.clone(),
        }),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundRouterError {
    #[error("failed to subscribe to events: {0}")]
    SubscriptionFailed(String),

    #[error("frame encoding failed: {0}")]
    EncodeFailed(String),

    #[error("wire send failed: transport channel closed")]
    WireSendFailed,
}
