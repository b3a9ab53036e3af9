pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn conversations(name: &str) -> String {
        read_or_panic(Path::new("conversations").join(name))
    }

    pub fn messages(name: &str) -> String {
        read_or_panic(Path::new("messages").join(name))
    }

    pub fn users(name: &str) -> String {
        read_or_panic(Path::new("users").join(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod data {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use chrono::Utc;

    use natter_core::model::{Conversation, Message, MessageType, PresenceEntry, User};
    use natter_rest::{DataService, DataServiceError};

    #[derive(Default)]
    struct MemoryState {
        conversations: Vec<Conversation>,
        users: Vec<User>,
        presence: Vec<PresenceEntry>,
        messages: HashMap<String, Vec<Message>>,
        failing: HashSet<String>,
        read_calls: Vec<String>,
        mark_all_read_calls: u32,
        next_message_seq: u32,
    }

    /// Scripted in-memory `DataService` for component tests.
    ///
    /// Seed it with `put_*`, force individual operations to fail with
    /// `fail_on`, and inspect what the component asked for afterwards.
    pub struct MemoryDataService {
        state: Mutex<MemoryState>,
        sender_id: String,
    }

    impl Default for MemoryDataService {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryDataService {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MemoryState::default()),
                sender_id: "u-local".to_string(),
            }
        }

        pub fn put_conversations(&self, conversations: Vec<Conversation>) {
            self.state.lock().unwrap().conversations = conversations;
        }

        pub fn put_users(&self, users: Vec<User>) {
            self.state.lock().unwrap().users = users;
        }

        pub fn put_presence(&self, presence: Vec<PresenceEntry>) {
            self.state.lock().unwrap().presence = presence;
        }

        pub fn put_messages(&self, conversation_id: &str, messages: Vec<Message>) {
            self.state
                .lock()
                .unwrap()
                .messages
                .insert(conversation_id.to_string(), messages);
        }

        /// Make the named operation (e.g. "fetch_conversations") return an
        /// error until `recover` is called for it.
        pub fn fail_on(&self, operation: &str) {
            self.state
                .lock()
                .unwrap()
                .failing
                .insert(operation.to_string());
        }

        pub fn recover(&self, operation: &str) {
            self.state.lock().unwrap().failing.remove(operation);
        }

        /// Conversation ids passed to `mark_read`, in call order.
        pub fn read_calls(&self) -> Vec<String> {
            self.state.lock().unwrap().read_calls.clone()
        }

        pub fn mark_all_read_calls(&self) -> u32 {
            self.state.lock().unwrap().mark_all_read_calls
        }

        fn check(&self, operation: &str) -> Result<(), DataServiceError> {
            if self.state.lock().unwrap().failing.contains(operation) {
                return Err(DataServiceError::RequestFailed {
                    endpoint: operation.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl DataService for MemoryDataService {
        async fn fetch_conversations(&self) -> Result<Vec<Conversation>, DataServiceError> {
            self.check("fetch_conversations")?;
            Ok(self.state.lock().unwrap().conversations.clone())
        }

        async fn fetch_users(&self) -> Result<Vec<User>, DataServiceError> {
            self.check("fetch_users")?;
            Ok(self.state.lock().unwrap().users.clone())
        }

        async fn fetch_presence(&self) -> Result<Vec<PresenceEntry>, DataServiceError> {
            self.check("fetch_presence")?;
            Ok(self.state.lock().unwrap().presence.clone())
        }

        async fn fetch_messages(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<Message>, DataServiceError> {
            self.check("fetch_messages")?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create_message(
            &self,
            conversation_id: &str,
            content: &str,
            message_type: MessageType,
        ) -> Result<Message, DataServiceError> {
            self.check("create_message")?;

            let mut state = self.state.lock().unwrap();
            state.next_message_seq += 1;
            let message = Message {
                id: format!("m-server-{}", state.next_message_seq),
                conversation_id: conversation_id.to_string(),
                sender_id: self.sender_id.clone(),
                content: content.to_string(),
                message_type,
                sent_at: Utc::now(),
            };
            state
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            Ok(message)
        }

        async fn create_direct_conversation(
            &self,
            target_user_id: &str,
        ) -> Result<Conversation, DataServiceError> {
            self.check("create_direct_conversation")?;

            let mut state = self.state.lock().unwrap();
            let id = format!("dm-{target_user_id}");
            if let Some(existing) = state.conversations.iter().find(|c| c.id == id) {
                return Ok(existing.clone());
            }

            let name = state
                .users
                .iter()
                .find(|u| u.id == target_user_id)
                .map(|u| u.display_name.clone())
                .unwrap_or_else(|| target_user_id.to_string());
            let conversation = Conversation {
                id,
                name,
                participant_ids: vec![self.sender_id.clone(), target_user_id.to_string()],
                last_message: None,
                unread_count: 0,
            };
            state.conversations.push(conversation.clone());
            Ok(conversation)
        }

        async fn mark_read(&self, conversation_id: &str) -> Result<(), DataServiceError> {
            self.check("mark_read")?;

            let mut state = self.state.lock().unwrap();
            state.read_calls.push(conversation_id.to_string());
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.unread_count = 0;
            }
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<(), DataServiceError> {
            self.check("mark_all_read")?;

            let mut state = self.state.lock().unwrap();
            state.mark_all_read_calls += 1;
            for conversation in &mut state.conversations {
                conversation.unread_count = 0;
            }
            Ok(())
        }
    }
}
