//! Durable document storage.
//!
//! ```text
//! ┌────────────┐   get / insert_if_absent / upsert   ┌──────────────────┐
//! │ DocumentApi│ ──────────────────────────────────► │ dyn DocumentStore│
//! │ Reconciler │                                     ├──────────────────┤
//! └────────────┘                                     │ RocksStore       │
//!                                                    │ MemoryStore      │
//!                                                    └──────────────────┘
//! ```
//!
//! The contract is small: one record per slug, created at most
//! once, replaced wholesale by upserts (last writer wins, no compare-and-swap).
//! Implementations are synchronous; async callers go through
//! `tokio::task::spawn_blocking`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::protocol::Slug;

/// Language tag given to documents created without one.
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// One persisted codespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub slug: Slug,
    pub content: String,
    pub language: String,
    /// Seconds since epoch; fixed at first insert
    pub created_at: u64,
    /// Seconds since epoch; refreshed by every upsert
    pub updated_at: u64,
}

impl Document {
    pub fn new(slug: Slug, content: impl Into<String>, language: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            slug,
            content: content.into(),
            language: language.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Empty document with the given language.
    pub fn empty(slug: Slug, language: impl Into<String>) -> Self {
        Self::new(slug, String::new(), language)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (doc, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(doc)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// No document under this slug
    #[error("Document not found: {0}")]
    NotFound(Slug),

    /// Backend unreachable or failing
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {e}"))
    }
}

/// Read/write contract every document backend fulfils.
pub trait DocumentStore: Send + Sync {
    /// Load the document stored under `slug`.
    fn get(&self, slug: &Slug) -> Result<Document, StoreError>;

    /// Store `doc` unless its slug already exists.
    ///
    /// Returns `true` if this call inserted the record, `false` if another
    /// record was already present (which is left untouched).
    fn insert_if_absent(&self, doc: &Document) -> Result<bool, StoreError>;

    /// Replace content and language, creating the record if missing.
    /// `created_at` of an existing record is preserved.
    fn upsert(&self, slug: &Slug, content: &str, language: &str) -> Result<Document, StoreError>;

    /// All stored slugs, in key order.
    fn list_slugs(&self) -> Result<Vec<Slug>, StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
