//! Room fan-out for content and selection events.
//!
//! One actor task owns the `SessionRegistry` and every session's outbound
//! queue. Connections talk to it through a cloneable `RelayHandle`:
//!
//! ```text
//! conn A ──┐                     ┌──► outbound(B) ──► socket B
//!          ├─► RelayCommand ─► Relay ──► outbound(C) ──► socket C
//! conn B ──┘    (mpsc, FIFO)     └──► Reconciler::schedule_persist
//! ```
//!
//! Commands are handled one at a time and handling never awaits, so joins,
//! leaves and broadcasts form a single total order: two events for the same
//! room reach every peer in the order the relay received them.
//!
//! Each broadcast frame is encoded once and offered to every recipient's
//! bounded queue with `try_send`. A full queue loses that frame for that
//! recipient only; delivery is at-most-once.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Selection, ServerEvent, Slug};
use crate::reconciler::Reconciler;
use crate::registry::{SessionId, SessionRegistry};

/// Encoded frames waiting to be written to one session's socket.
pub type Outbound = mpsc::Sender<Arc<str>>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Command queue capacity (connections wait when it is full)
    pub queue_capacity: usize,
    /// Also send content updates back to their sender
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            echo_to_sender: false,
        }
    }
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub events_relayed: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
    pub active_rooms: usize,
}

/// Room-scoped events the relay fans out.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    ContentChange {
        slug: Slug,
        content: String,
        language: Option<String>,
    },
    SelectionChange {
        slug: Slug,
        selection: Selection,
    },
    SelectionClear {
        slug: Slug,
    },
}

impl RoomEvent {
    pub fn slug(&self) -> &Slug {
        match self {
            Self::ContentChange { slug, .. }
            | Self::SelectionChange { slug, .. }
            | Self::SelectionClear { slug } => slug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("Relay has shut down")]
    Closed,
}

enum RelayCommand {
    Connect {
        session: SessionId,
        outbound: Outbound,
    },
    Join {
        session: SessionId,
        slug: Slug,
    },
    Event {
        session: SessionId,
        event: RoomEvent,
    },
    Disconnect {
        session: SessionId,
    },
    RoomSize {
        slug: Slug,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// Front door to the relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Register a session and the queue its frames go to.
    pub async fn connect(&self, session: SessionId, outbound: Outbound) -> Result<(), RelayError> {
        self.send(RelayCommand::Connect { session, outbound }).await
    }

    pub async fn join(&self, session: SessionId, slug: Slug) -> Result<(), RelayError> {
        self.send(RelayCommand::Join { session, slug }).await
    }

    pub async fn dispatch(&self, session: SessionId, event: RoomEvent) -> Result<(), RelayError> {
        self.send(RelayCommand::Event { session, event }).await
    }

    /// Drop the session's membership and outbound queue. Peers are not told.
    pub async fn disconnect(&self, session: SessionId) -> Result<(), RelayError> {
        self.send(RelayCommand::Disconnect { session }).await
    }

    pub async fn room_size(&self, slug: Slug) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::RoomSize { slug, reply }).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    async fn send(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::Closed)
    }
}

/// The relay actor. Lives inside the task started by [`Relay::spawn`].
pub struct Relay {
    config: RelayConfig,
    registry: SessionRegistry,
    sessions: HashMap<SessionId, Outbound>,
    reconciler: Reconciler,
    events_relayed: u64,
    frames_delivered: u64,
    frames_dropped: u64,
}

impl Relay {
    /// Start the actor. It stops once every handle is dropped.
    pub fn spawn(config: RelayConfig, reconciler: Reconciler) -> RelayHandle {
        let (commands, rx) = mpsc::channel(config.queue_capacity.max(1));
        let relay = Relay {
            config,
            registry: SessionRegistry::new(),
            sessions: HashMap::new(),
            reconciler,
            events_relayed: 0,
            frames_delivered: 0,
            frames_dropped: 0,
        };
        tokio::spawn(relay.run(rx));
        RelayHandle { commands }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RelayCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        log::debug!("Relay stopped");
    }

    fn handle(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect { session, outbound } => {
                self.sessions.insert(session, outbound);
            }
            RelayCommand::Join { session, slug } => self.on_join(session, slug),
            RelayCommand::Event { session, event } => self.on_event(session, event),
            RelayCommand::Disconnect { session } => self.on_disconnect(session),
            RelayCommand::RoomSize { slug, reply } => {
                let _ = reply.send(self.registry.room_size(&slug));
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn on_join(&mut self, session: SessionId, slug: Slug) {
        if !self.sessions.contains_key(&session) {
            log::warn!("Ignoring join to {slug} from unknown session {session}");
            return;
        }
        if let Some(previous) = self.registry.join(session, slug.clone()) {
            log::debug!("Session {session} left {previous}");
        }
        log::info!(
            "Session {session} joined {slug} ({} members)",
            self.registry.room_size(&slug)
        );
    }

    fn on_disconnect(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        if let Some(slug) = self.registry.leave(session) {
            log::info!(
                "Session {session} left {slug} ({} members)",
                self.registry.room_size(&slug)
            );
        }
    }

    fn on_event(&mut self, session: SessionId, event: RoomEvent) {
        self.events_relayed += 1;
        if !self.registry.is_member(event.slug(), session) {
            log::debug!("Session {session} sent to {} without joining it", event.slug());
        }

        match event {
            RoomEvent::ContentChange {
                slug,
                content,
                language,
            } => {
                let update = ServerEvent::ContentUpdate {
                    content: content.clone(),
                };
                self.broadcast(&slug, session, &update, self.config.echo_to_sender);
                self.reconciler.schedule_persist(slug, content, language);
            }
            RoomEvent::SelectionChange { slug, selection } => {
                log::trace!("Selection change in {slug} from {session}");
                self.broadcast(&slug, session, &ServerEvent::SelectionUpdate { selection }, false);
            }
            RoomEvent::SelectionClear { slug } => {
                log::trace!("Selection clear in {slug} from {session}");
                self.broadcast(&slug, session, &ServerEvent::SelectionClear, false);
            }
        }
    }

    /// Offer one encoded frame to every member of `slug` (minus the sender).
    fn broadcast(&mut self, slug: &Slug, sender: SessionId, event: &ServerEvent, include_sender: bool) {
        let targets = if include_sender {
            self.registry.members(slug)
        } else {
            self.registry.members_excluding(slug, sender)
        };
        if targets.is_empty() {
            return;
        }

        let frame: Arc<str> = match event.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                log::error!("Failed to encode broadcast for {slug}: {e}");
                return;
            }
        };

        for target in targets {
            let Some(outbound) = self.sessions.get(&target) else {
                continue;
            };
            match outbound.try_send(frame.clone()) {
                Ok(()) => self.frames_delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.frames_dropped += 1;
                    log::warn!("Session {target} is lagging, dropped frame for {slug}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Session {target} closed before disconnect was processed");
                }
            }
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            events_relayed: self.events_relayed,
            frames_delivered: self.frames_delivered,
            frames_dropped: self.frames_dropped,
            active_sessions: self.sessions.len(),
            active_rooms: self.registry.room_count(),
        }
    }
}
