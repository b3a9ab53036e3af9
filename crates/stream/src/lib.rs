//! Message history of the open conversation.
//!
//! `open` always reloads the full history from the data service; there is
//! no incremental merge across room switches. Sends are optimistic: the
//! local entry appears immediately and is replaced in place by the
//! server-confirmed copy, or flagged failed and kept visible.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use natter_core::error::EventBusError;
use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use natter_core::model::{Identity, Message, MessageType};
use natter_rest::{DataService, DataServiceError};
use natter_room::ActiveRoom;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("no conversation is open")]
    NoOpenConversation,

    #[error("data service error: {0}")]
    DataService(#[from] DataServiceError),

    #[error("event bus error: {0}")]
    EventBus(String),
}

/// Delivery progress of a message in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic local entry awaiting the server's confirmation.
    Pending,
    Sent,
    /// The remote write failed; the entry stays visible for retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedMessage {
    pub message: Message,
    pub delivery: DeliveryState,
}

#[derive(Default)]
struct StreamState {
    conversation_id: Option<String>,
    messages: Vec<StreamedMessage>,
}

/// History of the single open conversation, in receipt order.
pub struct MessageStream<D: DataService> {
    data: Arc<D>,
    event_bus: Arc<dyn EventBus>,
    identity: Identity,
    active_room: ActiveRoom,
    state: Mutex<StreamState>,
}

impl<D: DataService> MessageStream<D> {
    pub fn new(
        data: Arc<D>,
        event_bus: Arc<dyn EventBus>,
        identity: Identity,
        active_room: ActiveRoom,
    ) -> Self {
        Self {
            data,
            event_bus,
            identity,
            active_room,
            state: Mutex::new(StreamState::default()),
        }
    }

    /// The conversation the stream currently shows.
    pub fn conversation_id(&self) -> Option<String> {
        self.state.lock().unwrap().conversation_id.clone()
    }

    /// Snapshot of the history in receipt order.
    pub fn messages(&self) -> Vec<StreamedMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    /// Open `conversation_id`, replacing any current history with a full
    /// authoritative fetch.
    ///
    /// The conversation is claimed before the fetch, so a failed fetch
    /// leaves an empty history rather than another room's messages.
    pub async fn open(&self, conversation_id: &str) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock().unwrap();
            state.conversation_id = Some(conversation_id.to_string());
            state.messages.clear();
        }

        let messages = self.data.fetch_messages(conversation_id).await?;
        debug!(conversation_id, count = messages.len(), "conversation opened");

        let mut state = self.state.lock().unwrap();
        if state.conversation_id.as_deref() != Some(conversation_id) {
            // A later open raced this fetch; its history wins.
            return Ok(());
        }
        state.messages = messages
            .into_iter()
            .map(|message| StreamedMessage {
                message,
                delivery: DeliveryState::Sent,
            })
            .collect();
        Ok(())
    }

    /// Send `content` to the open conversation.
    ///
    /// The optimistic entry appears immediately with a client-generated
    /// id. On success it is replaced in place by the server's copy and a
    /// broadcast command is published; on failure it is kept, flagged
    /// `Failed`, and the error is returned. Nothing retries automatically.
    pub async fn send(&self, content: &str) -> Result<Message, StreamError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(StreamError::EmptyContent);
        }

        let conversation_id = self
            .state
            .lock()
            .unwrap()
            .conversation_id
            .clone()
            .ok_or(StreamError::NoOpenConversation)?;

        let local_id = Uuid::new_v4().to_string();
        let optimistic = Message {
            id: local_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: self.identity.user_id.clone(),
            content: trimmed.to_string(),
            message_type: MessageType::Text,
            sent_at: Utc::now(),
        };
        self.state.lock().unwrap().messages.push(StreamedMessage {
            message: optimistic,
            delivery: DeliveryState::Pending,
        });

        match self
            .data
            .create_message(&conversation_id, trimmed, MessageType::Text)
            .await
        {
            Ok(confirmed) => {
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %confirmed.id,
                    "send confirmed"
                );
                self.confirm_send(&local_id, &confirmed);
                emit_message_broadcast(&self.event_bus, &confirmed);
                Ok(confirmed)
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "message send failed");
                self.flag_failed(&local_id);
                Err(e.into())
            }
        }
    }

    /// Swap the optimistic entry for the server-confirmed copy, keeping
    /// its position. When the wire push for the same id landed first, the
    /// optimistic entry is dropped instead, so the id appears once.
    fn confirm_send(&self, local_id: &str, confirmed: &Message) {
        let mut state = self.state.lock().unwrap();
        if state.messages.iter().any(|m| m.message.id == confirmed.id) {
            state.messages.retain(|m| m.message.id != local_id);
            return;
        }

        if let Some(entry) = state.messages.iter_mut().find(|m| m.message.id == local_id) {
            entry.message = confirmed.clone();
            entry.delivery = DeliveryState::Sent;
        }
    }

    fn flag_failed(&self, local_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.messages.iter_mut().find(|m| m.message.id == local_id) {
            entry.delivery = DeliveryState::Failed;
        }
    }

    /// Append a pushed message when it belongs to the open conversation.
    /// An id already present is updated in place, never appended again.
    fn apply_push(&self, message: &Message) {
        if !self.active_room.is_active(&message.conversation_id) {
            debug!(
                conversation_id = %message.conversation_id,
                "dropping message push for inactive room"
            );
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.conversation_id.as_deref() != Some(message.conversation_id.as_str()) {
            debug!(
                conversation_id = %message.conversation_id,
                "dropping message push for a conversation that is not open"
            );
            return;
        }

        if let Some(existing) = state
            .messages
            .iter_mut()
            .find(|m| m.message.id == message.id)
        {
            existing.message = message.clone();
            existing.delivery = DeliveryState::Sent;
            return;
        }

        state.messages.push(StreamedMessage {
            message: message.clone(),
            delivery: DeliveryState::Sent,
        });
    }

    pub async fn handle_event(&self, event: &Event) {
        if let EventPayload::MessageReceived { message } = &event.payload {
            self.apply_push(message);
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), StreamError> {
        let mut sub = self
            .event_bus
            .subscribe("wire.message.received")
            .map_err(|e| StreamError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, message stream stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "message stream lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "message stream subscription error");
                    return Err(StreamError::EventBus(e.to_string()));
                }
            }
        }
    }
}

fn emit_message_broadcast(event_bus: &Arc<dyn EventBus>, message: &Message) {
    let _ = event_bus.publish(Event::new(
        Channel::new("ui.message.broadcast").unwrap(),
        EventSource::Client("stream".into()),
        EventPayload::MessageBroadcastRequested {
            conversation_id: message.conversation_id.clone(),
            message: message.clone(),
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use natter_core::event::{BroadcastEventBus, EventSubscription};
    use natter_core::model::{Conversation, PresenceEntry, User};
    use natter_room::RoomMembership;
    use natter_test_support::data::MemoryDataService;
    use natter_test_support::fixtures;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    fn test_identity() -> Identity {
        Identity {
            user_id: "u-local".into(),
            company_id: "acme".into(),
            display_name: "Local User".into(),
        }
    }

    fn history_data() -> Arc<MemoryDataService> {
        let data = Arc::new(MemoryDataService::new());
        data.put_messages(
            "c-sales",
            serde_json::from_str(&fixtures::messages("sales-history.json")).unwrap(),
        );
        data
    }

    fn make_stream<D: DataService>(
        data: Arc<D>,
    ) -> (Arc<MessageStream<D>>, Arc<dyn EventBus>, RoomMembership) {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let membership = RoomMembership::new(event_bus.clone());
        let stream = Arc::new(MessageStream::new(
            data,
            event_bus.clone(),
            test_identity(),
            membership.active_room(),
        ));
        (stream, event_bus, membership)
    }

    fn push_message(id: &str, conversation_id: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "u-2".to_string(),
            content: content.to_string(),
            message_type: MessageType::Text,
            sent_at: Utc::now(),
        }
    }

    fn wire_push(message: Message) -> Event {
        Event::new(
            Channel::new("wire.message.received").unwrap(),
            EventSource::Wire,
            EventPayload::MessageReceived { message },
        )
    }

    async fn next_payload(sub: &mut EventSubscription) -> EventPayload {
        timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .expect("subscription closed")
            .payload
    }

    #[tokio::test]
    async fn open_loads_the_full_history_in_order() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;

        stream.open("c-sales").await.unwrap();

        let messages = stream.messages();
        assert_eq!(messages.len(), 3);
        let ids: Vec<&str> = messages.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1001", "m-1002", "m-1003"]);
        assert!(messages.iter().all(|m| m.delivery == DeliveryState::Sent));
        assert_eq!(stream.conversation_id().as_deref(), Some("c-sales"));
    }

    #[tokio::test]
    async fn open_replaces_the_previous_history() {
        let data = history_data();
        data.put_messages("c-eng", vec![push_message("m-2001", "c-eng", "standup?")]);
        let (stream, _, membership) = make_stream(data);

        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();
        let _guard = membership.join("c-eng").await;
        stream.open("c-eng").await.unwrap();

        let messages = stream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.id, "m-2001");
        assert_eq!(stream.conversation_id().as_deref(), Some("c-eng"));
    }

    #[tokio::test]
    async fn open_failure_leaves_an_empty_history_for_the_new_room() {
        let data = history_data();
        let (stream, _, membership) = make_stream(data.clone());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        data.fail_on("fetch_messages");
        let result = stream.open("c-eng").await;

        assert!(matches!(result, Err(StreamError::DataService(_))));
        assert!(
            stream.messages().is_empty(),
            "the old room's history must not show under the new room"
        );
        assert_eq!(stream.conversation_id().as_deref(), Some("c-eng"));
    }

    #[tokio::test]
    async fn send_replaces_the_optimistic_entry_in_place() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        let confirmed = stream.send("Here's the summary").await.unwrap();

        let messages = stream.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].message.id, confirmed.id);
        assert_eq!(messages[3].message.content, "Here's the summary");
        assert_eq!(messages[3].delivery, DeliveryState::Sent);
        assert!(confirmed.id.starts_with("m-server-"), "server id replaces the local one");

        let second = stream.send("And the follow-up").await.unwrap();
        let messages = stream.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[4].message.id, second.id, "send order is kept");
    }

    #[tokio::test]
    async fn empty_content_is_rejected_before_any_network_call() {
        let data = history_data();
        let (stream, _, membership) = make_stream(data.clone());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        let result = stream.send("   \n  ").await;

        assert!(matches!(result, Err(StreamError::EmptyContent)));
        assert_eq!(stream.messages().len(), 3);
        assert_eq!(
            data.fetch_messages("c-sales").await.unwrap().len(),
            3,
            "nothing reached the data service"
        );
    }

    #[tokio::test]
    async fn send_without_an_open_conversation_is_an_error() {
        let (stream, _, _membership) = make_stream(history_data());

        let result = stream.send("hello?").await;

        assert!(matches!(result, Err(StreamError::NoOpenConversation)));
        assert!(stream.messages().is_empty());
    }

    #[tokio::test]
    async fn failed_send_keeps_the_entry_flagged() {
        let data = history_data();
        let (stream, event_bus, membership) = make_stream(data.clone());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();
        let mut sub = event_bus.subscribe("ui.message.broadcast").unwrap();

        data.fail_on("create_message");
        let result = stream.send("did this go through?").await;

        assert!(matches!(result, Err(StreamError::DataService(_))));
        let messages = stream.messages();
        assert_eq!(messages.len(), 4);
        let failed = &messages[3];
        assert_eq!(failed.delivery, DeliveryState::Failed);
        assert_eq!(failed.message.content, "did this go through?");
        assert_eq!(failed.message.sender_id, "u-local");

        // No broadcast hint goes out for a failed write.
        let no_event = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(no_event.is_err());
    }

    #[tokio::test]
    async fn confirmed_send_publishes_a_broadcast_hint() {
        let (stream, event_bus, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();
        let mut sub = event_bus.subscribe("ui.message.broadcast").unwrap();

        let confirmed = stream.send("Here's the summary").await.unwrap();

        match next_payload(&mut sub).await {
            EventPayload::MessageBroadcastRequested {
                conversation_id,
                message,
            } => {
                assert_eq!(conversation_id, "c-sales");
                assert_eq!(message.id, confirmed.id);
            }
            other => panic!("expected broadcast request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_for_the_open_conversation_appends_in_receipt_order() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        stream
            .handle_event(&wire_push(push_message("m-1004", "c-sales", "one more thing")))
            .await;
        stream
            .handle_event(&wire_push(push_message("m-1005", "c-sales", "and another")))
            .await;

        let messages = stream.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[3].message.id, "m-1004");
        assert_eq!(messages[4].message.id, "m-1005");
    }

    #[tokio::test]
    async fn push_for_another_conversation_is_ignored() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        stream
            .handle_event(&wire_push(push_message("m-2001", "c-eng", "standup?")))
            .await;

        assert_eq!(stream.messages().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_push_never_double_appends() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        stream
            .handle_event(&wire_push(push_message(
                "m-1003",
                "c-sales",
                "Quarterly numbers are in (edited)",
            )))
            .await;

        let messages = stream.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[2].message.content,
            "Quarterly numbers are in (edited)",
            "redelivery updates the entry in place"
        );
    }

    #[tokio::test]
    async fn push_after_confirmation_does_not_duplicate() {
        let (stream, _, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        let confirmed = stream.send("Here's the summary").await.unwrap();
        stream
            .handle_event(&wire_push(push_message(
                &confirmed.id,
                "c-sales",
                "Here's the summary",
            )))
            .await;

        assert_eq!(stream.messages().len(), 4);
    }

    /// Data service whose `create_message` parks until released, so a test
    /// can interleave a wire push with an in-flight send.
    struct GatedDataService {
        release: Notify,
    }

    impl GatedDataService {
        fn new() -> Self {
            Self {
                release: Notify::new(),
            }
        }
    }

    impl DataService for GatedDataService {
        async fn fetch_conversations(&self) -> Result<Vec<Conversation>, DataServiceError> {
            Ok(Vec::new())
        }

        async fn fetch_users(&self) -> Result<Vec<User>, DataServiceError> {
            Ok(Vec::new())
        }

        async fn fetch_presence(&self) -> Result<Vec<PresenceEntry>, DataServiceError> {
            Ok(Vec::new())
        }

        async fn fetch_messages(
            &self,
            _conversation_id: &str,
        ) -> Result<Vec<Message>, DataServiceError> {
            Ok(Vec::new())
        }

        async fn create_message(
            &self,
            conversation_id: &str,
            content: &str,
            message_type: MessageType,
        ) -> Result<Message, DataServiceError> {
            self.release.notified().await;
            Ok(Message {
                id: "m-server-race".to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: "u-local".to_string(),
                content: content.to_string(),
                message_type,
                sent_at: Utc::now(),
            })
        }

        async fn create_direct_conversation(
            &self,
            target_user_id: &str,
        ) -> Result<Conversation, DataServiceError> {
            Ok(Conversation {
                id: format!("dm-{target_user_id}"),
                name: target_user_id.to_string(),
                participant_ids: Vec::new(),
                last_message: None,
                unread_count: 0,
            })
        }

        async fn mark_read(&self, _conversation_id: &str) -> Result<(), DataServiceError> {
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<(), DataServiceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_arriving_before_the_confirmation_wins_the_race() {
        let data = Arc::new(GatedDataService::new());
        let (stream, _, membership) = make_stream(data.clone());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        let sender = stream.clone();
        let send_task = tokio::spawn(async move { sender.send("racing").await });
        tokio::task::yield_now().await;
        assert_eq!(stream.messages()[0].delivery, DeliveryState::Pending);

        // The server's fan-out lands before its HTTP response.
        stream
            .handle_event(&wire_push(push_message("m-server-race", "c-sales", "racing")))
            .await;
        data.release.notify_one();
        let confirmed = send_task.await.unwrap().unwrap();

        let messages = stream.messages();
        assert_eq!(confirmed.id, "m-server-race");
        assert_eq!(messages.len(), 1, "the id appears exactly once");
        assert_eq!(messages[0].message.id, "m-server-race");
        assert_eq!(messages[0].delivery, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn run_loop_appends_pushed_messages() {
        let (stream, event_bus, membership) = make_stream(history_data());
        let _guard = membership.join("c-sales").await;
        stream.open("c-sales").await.unwrap();

        let handle = tokio::spawn(stream.clone().run());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        event_bus
            .publish(wire_push(push_message("m-1004", "c-sales", "one more thing")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stream.messages().len(), 4);

        handle.abort();
    }
}
