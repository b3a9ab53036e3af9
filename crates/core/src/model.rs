use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user known to the messaging backend.
///
/// Users are owned by the identity collaborator; the core references them
/// by id and keeps only the display data it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

/// Coarse presence: reachable on the realtime connection or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    #[default]
    Offline,
}

/// Last-known presence of a single user.
///
/// The default value (offline, no last-seen) is what unknown users read
/// as; a missing cache entry is never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub availability: Availability,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One row of the presence snapshot served by the data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub status: Availability,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Message content classification. Anything the client does not natively
/// render degrades to `Other` instead of failing deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    #[serde(other)]
    Other,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id, or a client-generated placeholder while an
    /// optimistic send awaits its authoritative copy.
    pub id: String,

    pub conversation_id: String,

    pub sender_id: String,

    /// Plain-text message body.
    pub content: String,

    #[serde(default)]
    pub message_type: MessageType,

    /// When the message was sent (UTC).
    pub sent_at: DateTime<Utc>,
}

/// The last-message preview carried on a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl From<&Message> for MessageSummary {
    fn from(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            sent_at: message.sent_at,
        }
    }
}

/// A conversation visible to the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,

    pub name: String,

    /// Participant user ids in server order.
    #[serde(default)]
    pub participant_ids: Vec<String>,

    pub last_message: Option<MessageSummary>,

    #[serde(default)]
    pub unread_count: u32,
}

/// A user currently composing in some conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    pub display_name: String,
}

/// The identity a session runs under, supplied explicitly by the
/// embedding application rather than read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub company_id: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_type_degrades_to_other() {
        let parsed: MessageType = serde_json::from_str("\"sticker\"").unwrap();
        assert_eq!(parsed, MessageType::Other);

        let parsed: MessageType = serde_json::from_str("\"text\"").unwrap();
        assert_eq!(parsed, MessageType::Text);
    }

    #[test]
    fn availability_defaults_to_offline() {
        assert_eq!(Availability::default(), Availability::Offline);
        assert_eq!(PresenceInfo::default().availability, Availability::Offline);
        assert!(PresenceInfo::default().last_seen.is_none());
    }

    #[test]
    fn message_uses_camel_case_field_names() {
        let message = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            message_type: MessageType::Text,
            sent_at: Utc::now(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("conversationId").is_some());
        assert!(json.get("senderId").is_some());
        assert!(json.get("messageType").is_some());
        assert!(json.get("sentAt").is_some());
    }

    #[test]
    fn conversation_tolerates_missing_optional_fields() {
        let conversation: Conversation =
            serde_json::from_str(r#"{"id": "c1", "name": "Sales", "lastMessage": null}"#).unwrap();

        assert_eq!(conversation.unread_count, 0);
        assert!(conversation.participant_ids.is_empty());
        assert!(conversation.last_message.is_none());
    }

    #[test]
    fn presence_entry_reads_snapshot_rows() {
        let entry: PresenceEntry = serde_json::from_str(
            r#"{"userId": "u1", "status": "online", "lastSeen": "2025-03-01T10:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.status, Availability::Online);
        assert!(entry.last_seen.is_some());
    }
}
