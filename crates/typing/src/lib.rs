//! Typing indicators for the active conversation.
//!
//! Local keystrokes collapse into at most one typing announcement per
//! burst, with a single pending stop timer per conversation that every
//! further keystroke pushes back. Remote typing pushes populate a
//! per-conversation set whose entries expire on their own timer when no
//! stop signal arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use natter_core::error::EventBusError;
use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use natter_core::model::{Identity, TypingUser};
use natter_room::ActiveRoom;

/// Idle gap after the last keystroke before stop-typing is announced.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// How long a remote typing entry survives without a fresh signal.
const REMOTE_TYPING_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TypingError {
    #[error("event bus error: {0}")]
    EventBus(String),
}

struct LocalTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct RemoteTyping {
    display_name: String,
    timer_id: u64,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    /// Pending stop timer per conversation the local user is typing in.
    local: HashMap<String, LocalTimer>,
    /// conversation id -> user id -> live typing entry.
    remote: HashMap<String, HashMap<String, RemoteTyping>>,
    /// Monotonic tag distinguishing a rescheduled timer from the one it
    /// replaced, for timer tasks that pass their sleep before the abort
    /// lands.
    next_timer_id: u64,
}

/// Debounces local typing signals and tracks who is typing remotely.
pub struct TypingCoordinator {
    event_bus: Arc<dyn EventBus>,
    identity: Identity,
    active_room: ActiveRoom,
    state: Arc<Mutex<TypingState>>,
}

impl TypingCoordinator {
    pub fn new(event_bus: Arc<dyn EventBus>, identity: Identity, active_room: ActiveRoom) -> Self {
        Self {
            event_bus,
            identity,
            active_room,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    /// Record a local input change in `conversation_id`.
    ///
    /// The first keystroke of a burst announces typing; every keystroke
    /// within the debounce window only pushes the pending stop back. The
    /// stop announcement fires exactly once, when the window passes with
    /// no further input.
    pub fn notify_local_typing(&self, conversation_id: &str) {
        let mut state = self.state.lock().unwrap();

        match state.local.remove(conversation_id) {
            Some(previous) => {
                previous.handle.abort();
            }
            None => {
                debug!(conversation_id, "typing burst started");
                emit_typing_start(&self.event_bus, &self.identity, conversation_id);
            }
        }

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let handle = self.spawn_stop_timer(conversation_id, id);
        state
            .local
            .insert(conversation_id.to_string(), LocalTimer { id, handle });
    }

    /// Remote users currently typing in `conversation_id`, ordered by
    /// user id.
    pub fn typing_users(&self, conversation_id: &str) -> Vec<TypingUser> {
        let state = self.state.lock().unwrap();
        let mut users: Vec<TypingUser> = state
            .remote
            .get(conversation_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(user_id, entry)| TypingUser {
                        user_id: user_id.clone(),
                        display_name: entry.display_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Drop all typing state without announcing anything.
    ///
    /// Pending local stop timers are cancelled rather than fired; remote
    /// peers expire a stale indicator on their own TTL.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, timer) in state.local.drain() {
            timer.handle.abort();
        }
        for (_, users) in state.remote.drain() {
            for (_, entry) in users {
                entry.expiry.abort();
            }
        }
    }

    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::TypingStarted {
                conversation_id,
                user_id,
                display_name,
            } => {
                self.apply_remote_typing(conversation_id, user_id, display_name);
            }
            EventPayload::TypingStopped {
                conversation_id,
                user_id,
            } => {
                self.apply_remote_stop(conversation_id, user_id);
            }
            EventPayload::RoomLeaveRequested { conversation_id } => {
                debug!(conversation_id = %conversation_id, "room left, dropping typing state");
                self.clear();
            }
            _ => {}
        }
    }

    fn apply_remote_typing(&self, conversation_id: &str, user_id: &str, display_name: &str) {
        if !self.active_room.is_active(conversation_id) {
            debug!(conversation_id, user_id, "dropping typing push for inactive room");
            return;
        }
        if user_id == self.identity.user_id {
            // The local indicator never joins the remote set.
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.next_timer_id += 1;
        let timer_id = state.next_timer_id;
        let expiry = self.spawn_remote_expiry(conversation_id, user_id, timer_id);
        let entry = RemoteTyping {
            display_name: display_name.to_string(),
            timer_id,
            expiry,
        };

        if let Some(previous) = state
            .remote
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user_id.to_string(), entry)
        {
            // A fresh signal replaces the entry, never duplicates it.
            previous.expiry.abort();
        }
    }

    fn apply_remote_stop(&self, conversation_id: &str, user_id: &str) {
        if !self.active_room.is_active(conversation_id) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state
            .remote
            .get_mut(conversation_id)
            .and_then(|users| users.remove(user_id))
        {
            entry.expiry.abort();
        }
    }

    fn spawn_stop_timer(&self, conversation_id: &str, timer_id: u64) -> JoinHandle<()> {
        let conversation_id = conversation_id.to_string();
        let state = Arc::clone(&self.state);
        let event_bus = Arc::clone(&self.event_bus);
        let identity = self.identity.clone();

        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;

            {
                let mut state = state.lock().unwrap();
                let owns_slot = state
                    .local
                    .get(&conversation_id)
                    .is_some_and(|timer| timer.id == timer_id);
                if !owns_slot {
                    return;
                }
                state.local.remove(&conversation_id);
            }

            debug!(conversation_id = %conversation_id, "typing burst idle, announcing stop");
            emit_typing_stop(&event_bus, &identity, &conversation_id);
        })
    }

    fn spawn_remote_expiry(
        &self,
        conversation_id: &str,
        user_id: &str,
        timer_id: u64,
    ) -> JoinHandle<()> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            tokio::time::sleep(REMOTE_TYPING_TTL).await;

            let mut state = state.lock().unwrap();
            let Some(users) = state.remote.get_mut(&conversation_id) else {
                return;
            };
            let owns_entry = users
                .get(&user_id)
                .is_some_and(|entry| entry.timer_id == timer_id);
            if owns_entry {
                users.remove(&user_id);
                debug!(
                    conversation_id = %conversation_id,
                    user_id = %user_id,
                    "typing entry expired without a stop signal"
                );
            }
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<(), TypingError> {
        let mut sub = self
            .event_bus
            .subscribe("{wire,ui}.**")
            .map_err(|e| TypingError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, typing coordinator stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "typing coordinator lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "typing coordinator subscription error");
                    return Err(TypingError::EventBus(e.to_string()));
                }
            }
        }
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        self.clear();
    }
}

fn emit_typing_start(event_bus: &Arc<dyn EventBus>, identity: &Identity, conversation_id: &str) {
    let _ = event_bus.publish(Event::new(
        Channel::new("ui.typing.start").unwrap(),
        EventSource::Client("typing".into()),
        EventPayload::TypingStartRequested {
            conversation_id: conversation_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        },
    ));
}

fn emit_typing_stop(event_bus: &Arc<dyn EventBus>, identity: &Identity, conversation_id: &str) {
    let _ = event_bus.publish(Event::new(
        Channel::new("ui.typing.stop").unwrap(),
        EventSource::Client("typing".into()),
        EventPayload::TypingStopRequested {
            conversation_id: conversation_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        },
    ));
}
