//! WebSocket server and per-connection session lifecycle.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Relay (registry + fan-out)
//!            ├── connection task ───┤
//! Client B ──┘   (one per socket)   └── DocumentApi (load-document)
//!                                          │
//!                              Reconciler ─┴─ DocumentStore (RocksDB / memory)
//! ```
//!
//! Each connection task:
//! - allocates a `SessionId` and registers its outbound queue with the relay
//! - decodes client frames and routes them (join / room events / load)
//! - writes queued frames back to the socket
//! - on close or transport error, tells the relay to drop the session
//!
//! A reconnecting client gets a brand-new session; state comes back through
//! `load-document`, never from peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::ServerConfig;
use crate::documents::DocumentApi;
use crate::protocol::{ClientEvent, ServerEvent, Slug};
use crate::reconciler::{Reconciler, ReconcilerConfig, ReconcilerStats};
use crate::registry::SessionId;
use crate::relay::{Relay, RelayConfig, RelayError, RelayHandle, RelayStats, RoomEvent};
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub relay: RelayStats,
    pub persistence: ReconcilerStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Errors that stop the server itself.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    documents: DocumentApi,
    reconciler: Reconciler,
    relay: RelayHandle,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured store and start the relay.
    ///
    /// Uses RocksDB when `storage_path` is set, otherwise an in-memory store.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Start with a caller-supplied store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let documents = DocumentApi::new(store, config.default_language.as_str());
        let reconciler = Reconciler::new(
            documents.clone(),
            ReconcilerConfig {
                debounce: config.persist_debounce,
            },
        );
        let relay = Relay::spawn(
            RelayConfig {
                queue_capacity: config.relay_queue,
                echo_to_sender: config.echo_to_sender,
            },
            reconciler.clone(),
        );

        Self {
            config,
            documents,
            reconciler,
            relay,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until accept fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve WebSocket connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Sync server listening on {addr}"),
            Err(_) => log::info!("Sync server listening"),
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                relay: self.relay.clone(),
                documents: self.documents.clone(),
                stats: self.stats.clone(),
                session_buffer: self.config.session_buffer,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Write pending edits now. Call before the process exits.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.reconciler.flush_pending().await;
        log::info!("Flushed {flushed} pending document writes");
        flushed
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            malformed_frames: s.malformed_frames.load(Ordering::Relaxed),
            relay: self.relay.stats().await.unwrap_or_default(),
            persistence: self.reconciler.stats(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn documents(&self) -> &DocumentApi {
        &self.documents
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }
}

/// Everything one connection task needs.
struct Connection {
    relay: RelayHandle,
    documents: DocumentApi,
    stats: Arc<AtomicServerStats>,
    session_buffer: usize,
}

impl Connection {
    async fn run(self, stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let session = SessionId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Arc<str>>(self.session_buffer.max(1));

        self.relay.connect(session, outbound_tx.clone()).await?;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Session {session} connected from {addr}");

        let result = self.pump(session, ws_stream, outbound_tx, outbound_rx).await;

        // Cleanup runs on every exit path, including transport errors
        if let Err(e) = self.relay.disconnect(session).await {
            log::warn!("Could not unregister session {session}: {e}");
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Session {session} disconnected");
        result
    }

    async fn pump(
        &self,
        session: SessionId,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        outbound_tx: mpsc::Sender<Arc<str>>,
        mut outbound_rx: mpsc::Receiver<Arc<str>>,
    ) -> Result<(), ConnectionError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            self.on_text(session, text.as_str(), &outbound_tx).await?;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping binary frame from session {session}");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Session {session} closed by peer");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Decode and route one text frame. Malformed frames are dropped.
    async fn on_text(
        &self,
        session: SessionId,
        text: &str,
        outbound: &mpsc::Sender<Arc<str>>,
    ) -> Result<(), RelayError> {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed frame from session {session}: {e}");
                return Ok(());
            }
        };

        match event {
            ClientEvent::JoinRoom { slug } => self.relay.join(session, slug).await,
            ClientEvent::ContentChange {
                slug,
                content,
                language,
            } => {
                let event = RoomEvent::ContentChange {
                    slug,
                    content,
                    language,
                };
                self.relay.dispatch(session, event).await
            }
            ClientEvent::SelectionChange { slug, selection } => {
                self.relay
                    .dispatch(session, RoomEvent::SelectionChange { slug, selection })
                    .await
            }
            ClientEvent::SelectionClear { slug } => {
                self.relay
                    .dispatch(session, RoomEvent::SelectionClear { slug })
                    .await
            }
            ClientEvent::LoadDocument { slug } => {
                self.load_document(session, slug, outbound.clone());
                Ok(())
            }
        }
    }

    /// Answer `load-document` off the read loop so store latency never
    /// delays the next inbound frame.
    fn load_document(&self, session: SessionId, slug: Slug, outbound: mpsc::Sender<Arc<str>>) {
        let documents = self.documents.clone();
        tokio::spawn(async move {
            let doc = match documents.fetch_or_create(&slug).await {
                Ok(doc) => doc,
                Err(e) => {
                    log::error!("Failed to load {slug} for session {session}: {e}");
                    return;
                }
            };
            let reply = ServerEvent::Document {
                slug: doc.slug,
                content: doc.content,
                language: doc.language,
            };
            match reply.encode() {
                Ok(text) => {
                    if outbound.send(text.into()).await.is_err() {
                        log::debug!("Session {session} gone before document reply");
                    }
                }
                Err(e) => log::error!("Failed to encode document reply: {e}"),
            }
        });
    }
}
