//! Conversation directory: the ordered conversation list, unread
//! counters, and the user roster.
//!
//! The list is hydrated from the data service and kept current by server
//! pushes. Order is server-determined; pushes edit entries in place and
//! only newly appearing conversations are prepended.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use natter_core::error::EventBusError;
use natter_core::event::{Event, EventBus, EventPayload};
use natter_core::model::{Conversation, Message, MessageSummary, User};
use natter_rest::{DataService, DataServiceError};
use natter_room::ActiveRoom;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("data service error: {0}")]
    DataService(#[from] DataServiceError),

    #[error("event bus error: {0}")]
    EventBus(String),
}

#[derive(Default)]
struct DirectoryState {
    conversations: Vec<Conversation>,
    roster: Vec<User>,
}

/// Ordered conversation list fed by REST hydration and wire pushes.
pub struct ConversationDirectory<D: DataService> {
    data: Arc<D>,
    event_bus: Arc<dyn EventBus>,
    active_room: ActiveRoom,
    state: Mutex<DirectoryState>,
}

impl<D: DataService> ConversationDirectory<D> {
    pub fn new(data: Arc<D>, event_bus: Arc<dyn EventBus>, active_room: ActiveRoom) -> Self {
        Self {
            data,
            event_bus,
            active_room,
            state: Mutex::new(DirectoryState::default()),
        }
    }

    /// Snapshot of the conversation list in server order.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().conversations.clone()
    }

    /// Sum of unread counters, for badge-style consumers.
    pub fn total_unread(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .conversations
            .iter()
            .fold(0u32, |total, c| total.saturating_add(c.unread_count))
    }

    /// Users selectable for starting a direct conversation.
    pub fn roster(&self) -> Vec<User> {
        self.state.lock().unwrap().roster.clone()
    }

    /// Replace the list with a fresh fetch.
    ///
    /// On error the previous list is kept untouched, so a flaky backend
    /// degrades to stale data instead of an empty screen.
    pub async fn refresh(&self) -> Result<(), DirectoryError> {
        let conversations = self.data.fetch_conversations().await?;
        debug!(count = conversations.len(), "conversation list refreshed");
        self.state.lock().unwrap().conversations = conversations;
        Ok(())
    }

    /// Hydrate the roster. The data service already excludes the local
    /// user from the list.
    pub async fn load_roster(&self) -> Result<(), DirectoryError> {
        let users = self.data.fetch_users().await?;
        debug!(count = users.len(), "roster loaded");
        self.state.lock().unwrap().roster = users;
        Ok(())
    }

    /// Create (or find) the direct conversation with `target_user_id` and
    /// make it visible in the directory.
    pub async fn start_direct(&self, target_user_id: &str) -> Result<Conversation, DirectoryError> {
        let conversation = self.data.create_direct_conversation(target_user_id).await?;
        debug!(conversation_id = %conversation.id, target_user_id, "direct conversation ready");
        self.insert_conversation(conversation.clone());
        Ok(conversation)
    }

    /// Zero the counter locally, then confirm with the data service.
    ///
    /// The local counter is not rolled back on failure; the next refresh
    /// or unread push corrects it.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), DirectoryError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.unread_count = 0;
            }
        }

        self.data.mark_read(conversation_id).await?;
        Ok(())
    }

    /// Zero every counter locally, then confirm with the data service.
    /// Same no-rollback contract as `mark_read`.
    pub async fn mark_all_read(&self) -> Result<(), DirectoryError> {
        {
            let mut state = self.state.lock().unwrap();
            for conversation in &mut state.conversations {
                conversation.unread_count = 0;
            }
        }

        self.data.mark_all_read().await?;
        Ok(())
    }

    /// Replace the entry with a matching id in place, or prepend when the
    /// id is new. Keeps one entry per id regardless of push/refresh races.
    fn insert_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock().unwrap();
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => state.conversations.insert(0, conversation),
        }
    }

    fn apply_unread(&self, conversation_id: &str, unread_count: u32) {
        let mut state = self.state.lock().unwrap();
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            Some(conversation) => conversation.unread_count = unread_count,
            None => debug!(conversation_id, "unread push for unknown conversation dropped"),
        }
    }

    fn apply_message(&self, message: &Message) {
        let mut state = self.state.lock().unwrap();
        let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        else {
            debug!(
                conversation_id = %message.conversation_id,
                "message for unknown conversation, directory untouched"
            );
            return;
        };

        conversation.last_message = Some(MessageSummary::from(message));
        if !self.active_room.is_active(&message.conversation_id) {
            // The server's absolute unread push corrects any drift.
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
    }

    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ConversationCreated { conversation } => {
                debug!(conversation_id = %conversation.id, "conversation created push");
                self.insert_conversation(conversation.clone());
            }
            EventPayload::ConversationUpdated { conversation } => {
                debug!(conversation_id = %conversation.id, "conversation updated push");
                self.insert_conversation(conversation.clone());
            }
            EventPayload::UnreadCountUpdated {
                conversation_id,
                unread_count,
            } => {
                self.apply_unread(conversation_id, *unread_count);
            }
            EventPayload::MessageReceived { message } => {
                self.apply_message(message);
            }
            EventPayload::NotificationReceived { .. } => {
                debug!("notification push, refreshing conversation list");
                if let Err(e) = self.refresh().await {
                    error!(error = %e, "refresh after notification failed");
                }
            }
            _ => {}
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), DirectoryError> {
        let mut sub = self
            .event_bus
            .subscribe("wire.**")
            .map_err(|e| DirectoryError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, conversation directory stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "conversation directory lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "conversation directory subscription error");
                    return Err(DirectoryError::EventBus(e.to_string()));
                }
            }
        }
    }
}
