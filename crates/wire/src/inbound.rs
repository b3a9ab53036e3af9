use std::sync::Arc;

use tracing::debug;

use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};

use crate::frame::ServerFrame;

/// Decodes raw frames from the transport and publishes them as `wire.*`
/// events. Frames that fail to decode are logged and dropped so unknown
/// server events never tear down the inbound pump.
pub struct InboundRouter {
    event_bus: Arc<dyn EventBus>,
}

impl InboundRouter {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self { event_bus }
    }

    pub fn dispatch(&self, bytes: &[u8]) {
        let frame = match ServerFrame::parse(bytes) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "dropping undecodable wire frame");
                return;
            }
        };

        let (channel_name, payload) = route_frame(frame);
        debug!(channel = channel_name, "wire frame dispatched");
        self.emit(channel_name, payload);
    }

    fn emit(&self, channel_name: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel_name) else {
            return;
        };

        let event = Event::new(channel, EventSource::Wire, payload);
        let _ = self.event_bus.publish(event);
    }
}

fn route_frame(frame: ServerFrame) -> (&'static str, EventPayload) {
    match frame {
        ServerFrame::MessageReceived(message) => (
            "wire.message.received",
            EventPayload::MessageReceived { message },
        ),
        ServerFrame::UserStatusChanged {
            user_id,
            status,
            last_seen,
        } => (
            "wire.presence.changed",
            EventPayload::PresenceChanged {
                user_id,
                availability: status,
                last_seen,
            },
        ),
        ServerFrame::UserTyping {
            conversation_id,
            user_id,
            user_name,
        } => (
            "wire.typing.started",
            EventPayload::TypingStarted {
                conversation_id,
                user_id,
                display_name: user_name,
            },
        ),
        ServerFrame::UserStopTyping {
            conversation_id,
            user_id,
        } => (
            "wire.typing.stopped",
            EventPayload::TypingStopped {
                conversation_id,
                user_id,
            },
        ),
        ServerFrame::UnreadCountUpdated {
            conversation_id,
            unread_count,
        } => (
            "wire.unread.updated",
            EventPayload::UnreadCountUpdated {
                conversation_id,
                unread_count,
            },
        ),
        ServerFrame::ConversationCreated(conversation) => (
            "wire.conversation.created",
            EventPayload::ConversationCreated { conversation },
        ),
        ServerFrame::ConversationUpdated(conversation) => (
            "wire.conversation.updated",
            EventPayload::ConversationUpdated { conversation },
        ),
        ServerFrame::Notification { message } => (
            "wire.notification.received",
            EventPayload::NotificationReceived { message },
        ),
    }
}
