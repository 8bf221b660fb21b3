//! # codeshare-sync: real-time shared codespaces
//!
//! Clients join a room named by a document slug. Edits and selections are
//! relayed to everyone else in the room, and the latest content is written
//! to durable storage once the room goes quiet.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   WebSocket / JSON   ┌──────────────────┐
//! │ CodespaceClient │ ◄──────────────────► │ SyncServer       │
//! │ (per user)      │                      │ (conn per task)  │
//! └─────────────────┘                      └────────┬─────────┘
//!                                                   │ RelayHandle
//!                                                   ▼
//!                                          ┌──────────────────┐
//!                                          │ Relay            │
//!                                          │ SessionRegistry  │
//!                                          └────────┬─────────┘
//!                                                   │ schedule_persist
//!                                                   ▼
//!                                          ┌──────────────────┐
//!                                          │ Reconciler       │
//!                                          │ (debounce, LWW)  │
//!                                          └────────┬─────────┘
//!                                                   ▼
//!                                          ┌──────────────────┐
//!                                          │ DocumentStore    │
//!                                          │ RocksDB / memory │
//!                                          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON event frames and slug validation
//! - [`registry`]: session → room membership
//! - [`relay`]: room fan-out actor
//! - [`reconciler`]: debounced, coalescing persistence
//! - [`documents`]: fetch / create / update over a store
//! - [`storage`]: `DocumentStore` trait with RocksDB and in-memory backends
//! - [`config`]: server configuration from defaults and environment
//! - [`server`]: WebSocket server and connection lifecycle
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod registry;
pub mod relay;
pub mod reconciler;
pub mod documents;
pub mod storage;
pub mod config;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientEvent, ProtocolError, Selection, ServerEvent, Slug};
pub use registry::{SessionId, SessionRegistry};
pub use relay::{Relay, RelayConfig, RelayError, RelayHandle, RelayStats, RoomEvent};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerStats};
pub use documents::DocumentApi;
pub use storage::{
    Document, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError, DEFAULT_LANGUAGE,
};
pub use config::{ConfigError, ServerConfig};
pub use server::{ConnectionError, ServerError, ServerStats, SyncServer};
pub use client::{CodespaceClient, ConnectionState};
