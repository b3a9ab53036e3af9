//! Session wiring. One [`ChatSession`] owns the trackers, the wire
//! client, and the background tasks that keep them fed.
//!
//! Intended call order is [`ChatSession::start`], then
//! [`ChatSession::connect`], then [`ChatSession::hydrate`]. `start`
//! spawns the component run loops and the wire pumps; `connect` brings
//! the transport up, which in turn makes the presence tracker announce
//! and the room membership re-join; `hydrate` seeds local state from
//! the data service. [`ChatSession::shutdown`] unwinds in the opposite
//! direction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use natter_core::config::Config;
use natter_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use natter_core::model::Identity;
use natter_directory::ConversationDirectory;
use natter_presence::PresenceTracker;
use natter_rest::DataService;
use natter_room::RoomMembership;
use natter_stream::MessageStream;
use natter_typing::TypingCoordinator;
use natter_wire::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, FrameReceiver,
    InboundRouter, OutboundRouter, WebSocketTransport, WireTransport, frame_channel,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const SYSTEM_COMPONENT: &str = "session";

const WIRE_CHANNEL_CAPACITY: usize = 256;

const INBOUND_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// How long `shutdown` lets the outbound path flush the final leave and
/// left-chat frames before the tasks are stopped and the transport
/// closes.
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// A live chat session: every tracker, the connection manager, and the
/// event routers, wired onto one shared event bus.
///
/// The session is generic over the data service and the wire transport
/// so tests can substitute scripted implementations; production code
/// uses `HttpDataService` and the default [`WebSocketTransport`].
pub struct ChatSession<D: DataService, T: WireTransport = WebSocketTransport> {
    identity: Identity,
    event_bus: Arc<dyn EventBus>,
    data: Arc<D>,
    connection: Arc<Mutex<ConnectionManager<T>>>,
    membership: Arc<RoomMembership>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingCoordinator>,
    directory: Arc<ConversationDirectory<D>>,
    stream: Arc<MessageStream<D>>,
    hydration_timeout: Duration,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl<D: DataService, T: WireTransport> ChatSession<D, T> {
    /// Build the full component graph from configuration. Nothing runs
    /// until [`start`](Self::start) is called.
    pub fn new(config: &Config, data: Arc<D>, event_bus: Arc<dyn EventBus>) -> Self {
        let identity = config.identity();

        let membership = Arc::new(RoomMembership::new(event_bus.clone()));
        let active_room = membership.active_room();

        let presence = Arc::new(PresenceTracker::new(event_bus.clone(), identity.clone()));
        let typing = Arc::new(TypingCoordinator::new(
            event_bus.clone(),
            identity.clone(),
            active_room.clone(),
        ));
        let directory = Arc::new(ConversationDirectory::new(
            data.clone(),
            event_bus.clone(),
            active_room.clone(),
        ));
        let stream = Arc::new(MessageStream::new(
            data.clone(),
            event_bus.clone(),
            identity.clone(),
            active_room,
        ));

        let connection = Arc::new(Mutex::new(ConnectionManager::with_event_bus(
            wire_config(config),
            event_bus.clone(),
        )));

        Self {
            identity,
            event_bus,
            data,
            connection,
            membership,
            presence,
            typing,
            directory,
            stream,
            hydration_timeout: Duration::from_secs(config.hydration.timeout_seconds),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.event_bus.clone()
    }

    pub fn presence(&self) -> Arc<PresenceTracker> {
        self.presence.clone()
    }

    pub fn typing(&self) -> Arc<TypingCoordinator> {
        self.typing.clone()
    }

    pub fn membership(&self) -> Arc<RoomMembership> {
        self.membership.clone()
    }

    pub fn directory(&self) -> Arc<ConversationDirectory<D>> {
        self.directory.clone()
    }

    pub fn stream(&self) -> Arc<MessageStream<D>> {
        self.stream.clone()
    }

    /// Spawn the component run loops, the outbound router, and the wire
    /// pumps. Calling `start` again is a no-op.
    ///
    /// Must run inside a Tokio runtime. Call it before `connect`: the
    /// announce and re-join reactions to `system.connection.established`
    /// only fire once the loops are up.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(spawn_component("presence", self.event_bus.clone(), {
            let presence = self.presence.clone();
            async move { presence.run().await.map_err(|e| e.to_string()) }
        }));
        tasks.push(spawn_component("typing", self.event_bus.clone(), {
            let typing = self.typing.clone();
            async move { typing.run().await.map_err(|e| e.to_string()) }
        }));
        tasks.push(spawn_component("room", self.event_bus.clone(), {
            let membership = self.membership.clone();
            async move { membership.run().await.map_err(|e| e.to_string()) }
        }));
        tasks.push(spawn_component("directory", self.event_bus.clone(), {
            let directory = self.directory.clone();
            async move { directory.run().await.map_err(|e| e.to_string()) }
        }));
        tasks.push(spawn_component("stream", self.event_bus.clone(), {
            let stream = self.stream.clone();
            async move { stream.run().await.map_err(|e| e.to_string()) }
        }));

        let (frame_sender, frame_receiver) = frame_channel(WIRE_CHANNEL_CAPACITY);
        let router = OutboundRouter::new(self.event_bus.clone(), frame_sender);
        tasks.push(spawn_component(
            "outbound",
            self.event_bus.clone(),
            async move { router.run().await.map_err(|e| e.to_string()) },
        ));

        tasks.push(spawn_outbound_pump(
            self.connection.clone(),
            frame_receiver,
            self.event_bus.clone(),
        ));
        tasks.push(spawn_inbound_pump(
            self.connection.clone(),
            InboundRouter::new(self.event_bus.clone()),
            self.event_bus.clone(),
        ));
    }

    /// Bring the wire connection up, retrying with backoff per the
    /// connection settings. Returns once connected or once the
    /// configured reconnect attempts are exhausted.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut connection = self.connection.lock().await;
        connection.connect().await?;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.lock().await.state()
    }

    /// Seed the trackers from the data service.
    ///
    /// The conversation list, the roster, and the presence snapshot are
    /// fetched concurrently under the configured hydration timeout. A
    /// failed or timed-out fetch degrades to empty state with a warning
    /// and a `system.error.occurred` event; `hydrate` never blocks the
    /// session indefinitely. Publishes `system.sync.started` on entry
    /// and `system.sync.completed` when done.
    pub async fn hydrate(&self) {
        publish_system(&self.event_bus, "system.sync.started", EventPayload::SyncStarted);

        let fetches = async {
            let (conversations, roster, presence) = tokio::join!(
                self.directory.refresh(),
                self.directory.load_roster(),
                self.data.fetch_presence(),
            );

            if let Err(e) = conversations {
                warn!(error = %e, "conversation hydration failed, starting empty");
                emit_component_error(&self.event_bus, "directory", e.to_string(), true);
            }
            if let Err(e) = roster {
                warn!(error = %e, "roster hydration failed, starting empty");
                emit_component_error(&self.event_bus, "directory", e.to_string(), true);
            }
            match presence {
                Ok(entries) => self.presence.apply_snapshot(entries),
                Err(e) => {
                    warn!(error = %e, "presence hydration failed, starting empty");
                    emit_component_error(&self.event_bus, "presence", e.to_string(), true);
                }
            }
        };

        if tokio::time::timeout(self.hydration_timeout, fetches)
            .await
            .is_err()
        {
            warn!(
                timeout_seconds = self.hydration_timeout.as_secs(),
                "hydration timed out, continuing with partial state"
            );
            emit_component_error(
                &self.event_bus,
                SYSTEM_COMPONENT,
                "hydration timed out".to_string(),
                true,
            );
        }

        let conversations = self.directory.conversations().len() as u64;
        debug!(conversations, "hydration complete");
        publish_system(
            &self.event_bus,
            "system.sync.completed",
            EventPayload::SyncCompleted { conversations },
        );
    }

    /// Tear the session down: leave the active room, announce that the
    /// user left the chat surface, stop the background tasks, close the
    /// connection. Only the first call does the work.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("session shutting down");
        publish_system(
            &self.event_bus,
            "system.shutdown.requested",
            EventPayload::ShutdownRequested {
                reason: "session closing".to_string(),
            },
        );

        self.membership.leave().await;
        self.presence.announce_left_chat();

        // The leave and left-chat frames are still in flight through the
        // router and the outbound pump; give them a moment to reach the
        // transport before the tasks stop.
        tokio::time::sleep(SHUTDOWN_FLUSH_GRACE).await;

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let disconnect_result = {
            let mut connection = self.connection.lock().await;
            connection.disconnect().await
        };
        if let Err(e) = disconnect_result {
            warn!(error = %e, "disconnect during shutdown failed");
        }
    }
}

impl<D: DataService, T: WireTransport> Drop for ChatSession<D, T> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn wire_config(config: &Config) -> ConnectionConfig {
    ConnectionConfig {
        url: config.server.ws_url.clone(),
        user_id: config.identity.user_id.clone(),
        timeout_seconds: config.connection.timeout_seconds,
        max_reconnect_attempts: config.connection.max_reconnect_attempts,
    }
}

/// Run a component loop to completion, reporting a terminated loop on
/// the bus so the embedder can surface it.
fn spawn_component<F>(
    component: &'static str,
    event_bus: Arc<dyn EventBus>,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(reason) = task.await {
            error!(component, %reason, "component task terminated");
            emit_component_error(&event_bus, component, reason, true);
        }
    })
}

/// Drain encoded frames from the outbound router into the connection.
/// A send failure triggers the manager's interruption recovery, backoff
/// included.
fn spawn_outbound_pump<T: WireTransport>(
    connection: Arc<Mutex<ConnectionManager<T>>>,
    mut frames: FrameReceiver,
    event_bus: Arc<dyn EventBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let send_result = {
                let mut manager = connection.lock().await;
                manager.send_frame(&frame).await
            };

            let Err(send_error) = send_result else {
                continue;
            };

            let reason = send_error.to_string();
            warn!(%reason, "failed to send frame over the wire");
            emit_component_error(&event_bus, "wire", reason.clone(), send_error.is_retryable());

            let recover_result = {
                let mut manager = connection.lock().await;
                manager.recover_after_network_interruption(reason).await
            };
            if let Err(recover_error) = recover_result {
                emit_component_error(
                    &event_bus,
                    "wire",
                    recover_error.to_string(),
                    recover_error.is_retryable(),
                );
            }
        }

        debug!("outbound pump stopped");
    })
}

/// Poll the connection for server frames and hand them to the inbound
/// router. A read failure triggers the manager's interruption recovery.
fn spawn_inbound_pump<T: WireTransport>(
    connection: Arc<Mutex<ConnectionManager<T>>>,
    router: InboundRouter,
    event_bus: Arc<dyn EventBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame_result = {
                let mut manager = connection.lock().await;
                manager.recv_frame_with_timeout(INBOUND_POLL_TIMEOUT).await
            };

            match frame_result {
                Ok(Some(frame)) => router.dispatch(&frame),
                Ok(None) => {
                    tokio::task::yield_now().await;
                }
                Err(recv_error) => {
                    let reason = recv_error.to_string();
                    warn!(%reason, "failed to read from the wire");
                    emit_component_error(
                        &event_bus,
                        "wire",
                        reason.clone(),
                        recv_error.is_retryable(),
                    );

                    let recover_result = {
                        let mut manager = connection.lock().await;
                        manager.recover_after_network_interruption(reason).await
                    };
                    if let Err(recover_error) = recover_result {
                        emit_component_error(
                            &event_bus,
                            "wire",
                            recover_error.to_string(),
                            recover_error.is_retryable(),
                        );
                    }
                }
            }
        }
    })
}

fn publish_system(event_bus: &Arc<dyn EventBus>, channel: &str, payload: EventPayload) {
    let _ = event_bus.publish(Event::new(
        Channel::new(channel).unwrap(),
        EventSource::System(SYSTEM_COMPONENT.into()),
        payload,
    ));
}

fn emit_component_error(
    event_bus: &Arc<dyn EventBus>,
    component: &str,
    message: String,
    recoverable: bool,
) {
    publish_system(
        event_bus,
        "system.error.occurred",
        EventPayload::ErrorOccurred {
            component: component.to_string(),
            message,
            recoverable,
        },
    );
}
