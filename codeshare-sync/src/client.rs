//! WebSocket client for a codespace server.
//!
//! Thin wrapper used by the integration tests, the benchmarks and anything
//! that wants to drive a room from Rust. One background task writes queued
//! frames to the socket, another decodes inbound frames into `ServerEvent`s.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ProtocolError, Selection, ServerEvent, Slug};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct CodespaceClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
}

impl CodespaceClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: None,
        }
    }

    /// Create a client and connect it in one step.
    pub async fn connect_to(server_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let mut client = Self::new(server_url);
        client.connect().await?;
        Ok(client)
    }

    /// Open the socket and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            // Sender side dropped: close politely
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(1024);
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        self.outgoing_tx = Some(out_tx);
        self.event_rx = Some(event_rx);
        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    pub async fn join(&self, slug: &Slug) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinRoom { slug: slug.clone() }).await
    }

    pub async fn send_content(&self, slug: &Slug, content: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::ContentChange {
            slug: slug.clone(),
            content: content.into(),
            language: None,
        })
        .await
    }

    pub async fn send_content_with_language(
        &self,
        slug: &Slug,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::ContentChange {
            slug: slug.clone(),
            content: content.into(),
            language: Some(language.into()),
        })
        .await
    }

    pub async fn send_selection(&self, slug: &Slug, selection: Selection) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SelectionChange {
            slug: slug.clone(),
            selection,
        })
        .await
    }

    pub async fn clear_selection(&self, slug: &Slug) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SelectionClear { slug: slug.clone() }).await
    }

    /// Ask for the stored document; the answer arrives as `ServerEvent::Document`.
    pub async fn load_document(&self, slug: &Slug) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::LoadDocument { slug: slug.clone() }).await
    }

    /// Send a raw text frame, bypassing encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outgoing()?
            .send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let text = event.encode()?;
        self.send_raw(text).await
    }

    fn outgoing(&self) -> Result<&mpsc::Sender<String>, ProtocolError> {
        self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)
    }

    /// Next event from the server, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.as_mut()?.recv().await
    }

    /// Close the connection. Already-queued frames are still written first.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
