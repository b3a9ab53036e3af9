use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use natter_core::error::EventBusError;
use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};

#[derive(Debug, thiserror::Error)]
pub enum RoomMembershipError {
    #[error("event bus error: {0}")]
    EventBus(String),
}

#[derive(Default)]
struct ActiveRoomState {
    conversation_id: Option<String>,
    epoch: u64,
}

/// Shared read handle on the at-most-one active room pointer.
///
/// `RoomMembership` is the only writer; the typing coordinator and message
/// stream read it to drop events for rooms the client is not subscribed to.
#[derive(Clone, Default)]
pub struct ActiveRoom {
    inner: Arc<RwLock<ActiveRoomState>>,
}

impl ActiveRoom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<String> {
        self.inner.read().unwrap().conversation_id.clone()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.inner.read().unwrap().conversation_id.as_deref() == Some(conversation_id)
    }

    fn set(&self, conversation_id: &str) -> u64 {
        let mut state = self.inner.write().unwrap();
        state.conversation_id = Some(conversation_id.to_string());
        state.epoch += 1;
        state.epoch
    }

    fn take(&self) -> Option<String> {
        self.inner.write().unwrap().conversation_id.take()
    }

    fn take_if_current(&self, conversation_id: &str, epoch: u64) -> bool {
        let mut state = self.inner.write().unwrap();
        if state.epoch == epoch && state.conversation_id.as_deref() == Some(conversation_id) {
            state.conversation_id = None;
            true
        } else {
            false
        }
    }
}

/// Tracks which single conversation room the connection is subscribed to.
///
/// `join` runs leave-then-join as one transaction under an internal mutex,
/// so two joins can never interleave and the leave for the old room always
/// reaches the wire before the join for the new one. The server forgets
/// room membership across a transport reconnect, so the run loop re-joins
/// the active room every time the connection is re-established.
pub struct RoomMembership {
    event_bus: Arc<dyn EventBus>,
    active: ActiveRoom,
    transition: Mutex<()>,
}

impl RoomMembership {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            event_bus,
            active: ActiveRoom::new(),
            transition: Mutex::new(()),
        }
    }

    /// Read handle for room-scoped event gating.
    pub fn active_room(&self) -> ActiveRoom {
        self.active.clone()
    }

    /// Subscribe to `conversation_id`, leaving the current room first.
    ///
    /// The active pointer moves only after both emissions, and the returned
    /// guard leaves the room when dropped or released.
    pub async fn join(&self, conversation_id: &str) -> RoomGuard {
        let _transition = self.transition.lock().await;

        if let Some(previous) = self.active.take() {
            debug!(conversation_id = %previous, "leaving active room before join");
            emit_room_leave(&self.event_bus, &previous);
        }

        debug!(conversation_id, "joining room");
        emit_room_join(&self.event_bus, conversation_id);
        let epoch = self.active.set(conversation_id);

        RoomGuard {
            conversation_id: conversation_id.to_string(),
            epoch,
            active: self.active.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    /// Unsubscribe from the active room. No-op when none is active.
    pub async fn leave(&self) {
        let _transition = self.transition.lock().await;

        if let Some(previous) = self.active.take() {
            debug!(conversation_id = %previous, "leaving room");
            emit_room_leave(&self.event_bus, &previous);
        }
    }

    async fn handle_event(&self, event: &Event) {
        if let EventPayload::ConnectionEstablished { .. } = &event.payload {
            let _transition = self.transition.lock().await;
            if let Some(active) = self.active.current() {
                debug!(conversation_id = %active, "re-joining active room after reconnect");
                emit_room_join(&self.event_bus, &active);
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), RoomMembershipError> {
        let mut sub = self
            .event_bus
            .subscribe("system.connection.established")
            .map_err(|e| RoomMembershipError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, room membership stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "room membership lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "room membership subscription error");
                    return Err(RoomMembershipError::EventBus(e.to_string()));
                }
            }
        }
    }
}

/// Scoped room subscription handle.
///
/// Dropping the guard leaves the room on every exit path. A later `join`
/// takes the room over and bumps the epoch, so a stale guard's drop never
/// leaves a room it no longer owns.
pub struct RoomGuard {
    conversation_id: String,
    epoch: u64,
    active: ActiveRoom,
    event_bus: Arc<dyn EventBus>,
}

impl RoomGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Leave the room now. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        if self.active.take_if_current(&self.conversation_id, self.epoch) {
            debug!(conversation_id = %self.conversation_id, "room guard dropped, leaving room");
            emit_room_leave(&self.event_bus, &self.conversation_id);
        }
    }
}

fn emit_room_join(event_bus: &Arc<dyn EventBus>, conversation_id: &str) {
    let _ = event_bus.publish(Event::new(
        Channel::new("ui.room.join").unwrap(),
        EventSource::Client("room".into()),
        EventPayload::RoomJoinRequested {
            conversation_id: conversation_id.to_string(),
        },
    ));
}

fn emit_room_leave(event_bus: &Arc<dyn EventBus>, conversation_id: &str) {
    let _ = event_bus.publish(Event::new(
        Channel::new("ui.room.leave").unwrap(),
        EventSource::Client("room".into()),
        EventPayload::RoomLeaveRequested {
            conversation_id: conversation_id.to_string(),
        },
    ));
}
