//! JSON event protocol for the codespace channel.
//!
//! Every frame is a WebSocket text message holding one JSON object tagged by
//! its `"event"` field:
//! ```text
//! client → server                          server → client
//! ┌──────────────────┬──────────────────┐  ┌──────────────────┬──────────────────┐
//! │ join-room        │ slug             │  │ content-update   │ content          │
//! │ content-change   │ slug, content,   │  │ selection-update │ selection        │
//! │                  │ language?        │  │ selection-clear  │ —                │
//! │ selection-change │ slug, selection  │  │ document         │ slug, content,   │
//! │ selection-clear  │ slug             │  │                  │ language         │
//! │ load-document    │ slug             │  └──────────────────┴──────────────────┘
//! └──────────────────┴──────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest slug accepted on the wire.
pub const MAX_SLUG_LEN: usize = 128;

/// URL-safe document identity; also names the document's room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    /// Validate and wrap a slug: 1..=128 chars of `[A-Za-z0-9_-]`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_SLUG_LEN {
            return Err(ProtocolError::InvalidSlug(raw));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ProtocolError::InvalidSlug(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Slug {
    type Error = ProtocolError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Slug::parse(raw)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque selection range as sent by the editor.
///
/// The relay never looks inside; whatever JSON the sender produced is what
/// peers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selection(pub serde_json::Value);

impl Selection {
    /// Build a `[start, end]` range, the shape plain-text editors use.
    pub fn range(start: u64, end: u64) -> Self {
        Self(serde_json::json!([start, end]))
    }
}

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        slug: Slug,
    },
    ContentChange {
        slug: Slug,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    SelectionChange {
        slug: Slug,
        selection: Selection,
    },
    SelectionClear {
        slug: Slug,
    },
    /// Fetch-or-create the stored document; answered with `document`.
    LoadDocument {
        slug: Slug,
    },
}

impl ClientEvent {
    /// The slug this event is addressed to.
    pub fn slug(&self) -> &Slug {
        match self {
            Self::JoinRoom { slug }
            | Self::ContentChange { slug, .. }
            | Self::SelectionChange { slug, .. }
            | Self::SelectionClear { slug }
            | Self::LoadDocument { slug } => slug,
        }
    }

    /// Parse one text frame.
    ///
    /// Anything that is not a well-formed event (bad JSON, unknown tag,
    /// missing field, invalid slug, null selection) is `Malformed`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: ClientEvent =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let ClientEvent::SelectionChange { selection, .. } = &event {
            if selection.0.is_null() {
                return Err(ProtocolError::Malformed("selection must not be null".into()));
            }
        }
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Frames the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    ContentUpdate {
        content: String,
    },
    SelectionUpdate {
        selection: Selection,
    },
    SelectionClear,
    Document {
        slug: Slug,
        content: String,
        language: String,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Invalid slug: {0:?}")]
    InvalidSlug(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),
}
