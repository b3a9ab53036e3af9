use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use natter_core::error::EventBusError;
use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use natter_core::model::{Identity, PresenceEntry, PresenceInfo};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("event bus error: {0}")]
    EventBus(String),
}

/// Tracks last-known presence of remote users and announces the local
/// user's presence over the wire.
///
/// The cache is lazy and last-write-wins: an entry appears on first
/// observation, every push overwrites it, and nothing is ever deleted.
/// An unknown user reads as offline with no last-seen value.
pub struct PresenceTracker {
    identity: Identity,
    statuses: RwLock<HashMap<String, PresenceInfo>>,
    event_bus: Arc<dyn EventBus>,
}

impl PresenceTracker {
    pub fn new(event_bus: Arc<dyn EventBus>, identity: Identity) -> Self {
        Self {
            identity,
            statuses: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// Last-known presence for a user. A missing entry is not an error;
    /// it reads as the default (offline, no last-seen).
    pub fn status(&self, user_id: &str) -> PresenceInfo {
        self.statuses
            .read()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of every cached entry, for list views that render presence
    /// alongside the roster.
    pub fn statuses(&self) -> HashMap<String, PresenceInfo> {
        self.statuses.read().unwrap().clone()
    }

    /// Seed the cache from a hydration snapshot. Entries overwrite any
    /// cached value; a later push corrects any staleness.
    pub fn apply_snapshot(&self, entries: Vec<PresenceEntry>) {
        let mut statuses = self.statuses.write().unwrap();
        for entry in entries {
            statuses.insert(
                entry.user_id,
                PresenceInfo {
                    availability: entry.status,
                    last_seen: entry.last_seen,
                },
            );
        }
    }

    /// Declare the local user online. The run loop repeats this after
    /// every reconnect since the server forgets presence across drops.
    pub fn announce_online(&self) {
        let _ = self.event_bus.publish(Event::new(
            Channel::new("ui.presence.online").unwrap(),
            EventSource::Client("presence".into()),
            EventPayload::OnlineAnnounceRequested {
                user_id: self.identity.user_id.clone(),
                company_id: self.identity.company_id.clone(),
            },
        ));
    }

    /// Announce that the local user has the messaging UI open.
    pub fn announce_viewing_chat(&self) {
        let _ = self.event_bus.publish(Event::new(
            Channel::new("ui.presence.viewing").unwrap(),
            EventSource::Client("presence".into()),
            EventPayload::ViewingChatRequested {
                user_id: self.identity.user_id.clone(),
            },
        ));
    }

    /// Announce that the local user closed the messaging UI. Skipping this
    /// on teardown leaves the server believing the client is still viewing.
    pub fn announce_left_chat(&self) {
        let _ = self.event_bus.publish(Event::new(
            Channel::new("ui.presence.left").unwrap(),
            EventSource::Client("presence".into()),
            EventPayload::LeftChatRequested {
                user_id: self.identity.user_id.clone(),
            },
        ));
    }

    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ConnectionEstablished { .. } => {
                debug!("connection established, announcing presence");
                self.announce_online();
                self.announce_viewing_chat();
            }
            EventPayload::PresenceChanged {
                user_id,
                availability,
                last_seen,
            } => {
                debug!(user_id = %user_id, ?availability, "presence changed");
                self.statuses.write().unwrap().insert(
                    user_id.clone(),
                    PresenceInfo {
                        availability: *availability,
                        last_seen: *last_seen,
                    },
                );
            }
            _ => {}
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), PresenceError> {
        let mut sub = self
            .event_bus
            .subscribe("{system,wire}.**")
            .map_err(|e| PresenceError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, presence tracker stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "presence tracker lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "presence tracker subscription error");
                    return Err(PresenceError::EventBus(e.to_string()));
                }
            }
        }
    }
}
