use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use natter_core::model::{Availability, Conversation, Message};

use crate::error::FrameError;

/// A frame sent from this client to the server.
///
/// Frames travel as JSON text messages shaped `{"event": ..., "data": ...}`.
/// Event names are kebab-case on the wire; payload keys are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    AnnounceOnline { user_id: String, company_id: String },

    #[serde(rename_all = "camelCase")]
    ViewingChat { user_id: String },

    #[serde(rename_all = "camelCase")]
    LeftChat { user_id: String },

    /// Data is the bare conversation id, not an object.
    JoinRoom(String),

    LeaveRoom(String),

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        user_id: String,
        display_name: String,
    },

    #[serde(rename_all = "camelCase")]
    StopTyping {
        conversation_id: String,
        user_id: String,
        display_name: String,
    },

    #[serde(rename_all = "camelCase")]
    BroadcastNewMessage {
        conversation_id: String,
        message: Message,
    },
}

impl ClientFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(|e| FrameError::EncodeFailed(e.to_string()))
    }
}

/// A frame pushed from the server to this client.
///
/// Unknown event names fail to parse; the inbound router logs and drops
/// them so protocol additions never break older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    MessageReceived(Message),

    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: String,
        status: Availability,
        last_seen: Option<DateTime<Utc>>,
    },

    /// The sender's name arrives as `userName` here even though outbound
    /// typing frames carry `displayName`.
    #[serde(rename_all = "camelCase")]
    UserTyping {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    UserStopTyping {
        conversation_id: String,
        user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    UnreadCountUpdated {
        conversation_id: String,
        unread_count: u32,
    },

    ConversationCreated(Conversation),

    ConversationUpdated(Conversation),

    Notification {
        #[serde(default)]
        message: String,
    },
}

impl ServerFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
        serde_json::from_str(text).map_err(|e| FrameError::DecodeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natter_core::model::MessageType;

    fn sample_message() -> Message {
        Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            message_type: MessageType::Text,
            sent_at: "2026-03-01T10:00:00Z".parse().unwrap(),
        }
    }

    // ── Outbound encoding ─────────────────────────────────────────

    #[test]
    fn announce_online_uses_wire_event_name() {
        let frame = ClientFrame::AnnounceOnline {
            user_id: "u1".into(),
            company_id: "acme".into(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "announce-online");
        assert_eq!(json["data"]["userId"], "u1");
        assert_eq!(json["data"]["companyId"], "acme");
    }

    #[test]
    fn viewing_and_left_chat_carry_user_id() {
        let viewing = ClientFrame::ViewingChat {
            user_id: "u1".into(),
        };
        let left = ClientFrame::LeftChat {
            user_id: "u1".into(),
        };

        let viewing_json: serde_json::Value =
            serde_json::from_slice(&viewing.to_bytes().unwrap()).unwrap();
        let left_json: serde_json::Value =
            serde_json::from_slice(&left.to_bytes().unwrap()).unwrap();

        assert_eq!(viewing_json["event"], "viewing-chat");
        assert_eq!(viewing_json["data"]["userId"], "u1");
        assert_eq!(left_json["event"], "left-chat");
        assert_eq!(left_json["data"]["userId"], "u1");
    }

    #[test]
    fn join_room_sends_bare_conversation_id() {
        let frame = ClientFrame::JoinRoom("conv-1".into());

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "join-room");
        assert_eq!(json["data"], "conv-1");
    }

    #[test]
    fn leave_room_sends_bare_conversation_id() {
        let frame = ClientFrame::LeaveRoom("conv-1".into());

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "leave-room");
        assert_eq!(json["data"], "conv-1");
    }

    #[test]
    fn typing_frames_use_display_name_key() {
        let frame = ClientFrame::Typing {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            display_name: "Alice".into(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "typing");
        assert_eq!(json["data"]["conversationId"], "c1");
        assert_eq!(json["data"]["displayName"], "Alice");
    }

    #[test]
    fn stop_typing_mirrors_typing_payload() {
        let frame = ClientFrame::StopTyping {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            display_name: "Alice".into(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "stop-typing");
        assert_eq!(json["data"]["displayName"], "Alice");
    }

    #[test]
    fn broadcast_new_message_nests_full_message() {
        let frame = ClientFrame::BroadcastNewMessage {
            conversation_id: "c1".into(),
            message: sample_message(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "broadcast-new-message");
        assert_eq!(json["data"]["conversationId"], "c1");
        assert_eq!(json["data"]["message"]["id"], "m1");
        assert_eq!(json["data"]["message"]["senderId"], "u1");
    }

    // ── Inbound decoding ──────────────────────────────────────────

    #[test]
    fn parses_message_received() {
        let raw = br#"{"event":"message-received","data":{"id":"m1","conversationId":"c1","senderId":"u2","content":"hi","sentAt":"2026-03-01T10:00:00Z"}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::MessageReceived(message) = frame else {
            panic!("expected message-received");
        };
        assert_eq!(message.id, "m1");
        assert_eq!(message.conversation_id, "c1");
        assert_eq!(message.message_type, MessageType::Text);
    }

    #[test]
    fn parses_user_status_changed_without_last_seen() {
        let raw = br#"{"event":"user-status-changed","data":{"userId":"u2","status":"online"}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::UserStatusChanged {
            user_id,
            status,
            last_seen,
        } = frame
        else {
            panic!("expected user-status-changed");
        };
        assert_eq!(user_id, "u2");
        assert_eq!(status, Availability::Online);
        assert!(last_seen.is_none());
    }

    #[test]
    fn parses_user_status_changed_with_last_seen() {
        let raw = br#"{"event":"user-status-changed","data":{"userId":"u2","status":"offline","lastSeen":"2026-03-01T09:30:00Z"}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::UserStatusChanged {
            status, last_seen, ..
        } = frame
        else {
            panic!("expected user-status-changed");
        };
        assert_eq!(status, Availability::Offline);
        assert!(last_seen.is_some());
    }

    #[test]
    fn parses_user_typing_with_user_name_key() {
        let raw = br#"{"event":"user-typing","data":{"conversationId":"c1","userId":"u2","userName":"Bob"}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::UserTyping {
            conversation_id,
            user_id,
            user_name,
        } = frame
        else {
            panic!("expected user-typing");
        };
        assert_eq!(conversation_id, "c1");
        assert_eq!(user_id, "u2");
        assert_eq!(user_name, "Bob");
    }

    #[test]
    fn parses_user_stop_typing() {
        let raw = br#"{"event":"user-stop-typing","data":{"conversationId":"c1","userId":"u2"}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        assert!(matches!(frame, ServerFrame::UserStopTyping { .. }));
    }

    #[test]
    fn parses_unread_count_updated() {
        let raw = br#"{"event":"unread-count-updated","data":{"conversationId":"c1","unreadCount":7}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::UnreadCountUpdated {
            conversation_id,
            unread_count,
        } = frame
        else {
            panic!("expected unread-count-updated");
        };
        assert_eq!(conversation_id, "c1");
        assert_eq!(unread_count, 7);
    }

    #[test]
    fn parses_conversation_created() {
        let raw = br#"{"event":"conversation-created","data":{"id":"c9","name":"Design","participantIds":["u1","u2"]}}"#;

        let frame = ServerFrame::parse(raw).unwrap();
        let ServerFrame::ConversationCreated(conversation) = frame else {
            panic!("expected conversation-created");
        };
        assert_eq!(conversation.id, "c9");
        assert_eq!(conversation.unread_count, 0);
    }

    #[test]
    fn parses_notification_with_and_without_message() {
        let with = br#"{"event":"notification","data":{"message":"mentioned you"}}"#;
        let without = br#"{"event":"notification","data":{}}"#;

        let ServerFrame::Notification { message } = ServerFrame::parse(with).unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(message, "mentioned you");

        let ServerFrame::Notification { message } = ServerFrame::parse(without).unwrap() else {
            panic!("expected notification");
        };
        assert!(message.is_empty());
    }

    // ── Failure modes ─────────────────────────────────────────────

    #[test]
    fn unknown_event_name_fails_to_parse() {
        let raw = br#"{"event":"user-joined-company","data":{"userId":"u2"}}"#;
        let result = ServerFrame::parse(raw);
        assert!(matches!(result, Err(FrameError::DecodeFailed(_))));
    }

    #[test]
    fn malformed_json_fails_to_parse() {
        let result = ServerFrame::parse(b"{\"event\": ");
        assert!(matches!(result, Err(FrameError::DecodeFailed(_))));
    }

    #[test]
    fn non_utf8_input_is_rejected() {
        let result = ServerFrame::parse(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(FrameError::NotUtf8)));
    }
}
