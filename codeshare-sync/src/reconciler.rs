//! Debounced persistence of live document state.
//!
//! ```text
//! content-change ──► schedule_persist(slug, content, language)
//!                         │  replace pending[slug], restart timer
//!                         ▼
//!                    ┌─────────────┐  quiet for `debounce`   ┌───────────────┐
//!                    │ PendingWrite│ ──────────────────────► │ store.upsert  │
//!                    │ per slug    │                         │ (blocking pool)│
//!                    └─────────────┘                         └───────────────┘
//! ```
//!
//! At most one write is pending per slug. A call inside the window replaces
//! the payload and aborts the previous timer, so N edits in one burst cost one
//! upsert carrying the last payload. Scheduling only touches the pending map
//! and spawns a timer; it never waits on the store.
//!
//! Writes to one slug are serialized by that slug's gate, so an older payload
//! never lands after a newer one. Slugs do not wait on each other: a slow
//! upsert for one room leaves every other room's writes on schedule.
//!
//! Failed writes are logged and counted, nothing more. The next edit to the
//! slug schedules a fresh write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::documents::DocumentApi;
use crate::protocol::Slug;
use crate::storage::{Document, StoreError};

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Quiescence window before a pending write is flushed
    pub debounce: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub scheduled: u64,
    /// Writes dropped because a newer edit replaced them
    pub coalesced: u64,
    pub persisted: u64,
    pub failed: u64,
    pub pending: usize,
}

#[derive(Default)]
struct AtomicReconcilerStats {
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Latest unsaved state of one slug.
struct PendingWrite {
    generation: u64,
    content: String,
    language: Option<String>,
    timer: JoinHandle<()>,
}

struct Inner {
    documents: DocumentApi,
    config: ReconcilerConfig,
    pending: Mutex<HashMap<Slug, PendingWrite>>,
    /// Per-slug gates, held across take-and-write
    write_gates: Mutex<HashMap<Slug, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
    stats: AtomicReconcilerStats,
}

/// Owner of all pending writes. Clones share state.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(documents: DocumentApi, config: ReconcilerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                documents,
                config,
                pending: Mutex::new(HashMap::new()),
                write_gates: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                stats: AtomicReconcilerStats::default(),
            }),
        }
    }

    pub fn documents(&self) -> &DocumentApi {
        &self.inner.documents
    }

    pub fn debounce(&self) -> Duration {
        self.inner.config.debounce
    }

    /// Existing document, or a fresh empty one with the default language.
    pub async fn fetch_or_create(&self, slug: &Slug) -> Result<Document, StoreError> {
        self.inner.documents.fetch_or_create(slug).await
    }

    /// Replace the pending write for `slug` and restart its quiescence timer.
    ///
    /// `language: None` keeps the language of the write being replaced; if
    /// there is none, the stored document's language (or the default) is
    /// used at flush time. Must be called from within a tokio runtime.
    pub fn schedule_persist(&self, slug: Slug, content: String, language: Option<String>) {
        let inner = &self.inner;
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        inner.stats.scheduled.fetch_add(1, Ordering::Relaxed);

        let mut pending = inner.lock_pending();
        let language = match pending.remove(&slug) {
            Some(previous) => {
                previous.timer.abort();
                inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                log::trace!("Coalesced pending write for {slug}");
                language.or(previous.language)
            }
            None => language,
        };

        let timer = {
            let inner = self.inner.clone();
            let slug = slug.clone();
            let debounce = inner.config.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                inner.flush_slug(&slug, Some(generation)).await;
            })
        };

        pending.insert(
            slug,
            PendingWrite {
                generation,
                content,
                language,
                timer,
            },
        );
    }

    /// Write every pending record now instead of waiting for its timer.
    ///
    /// Used on graceful shutdown. Keeps going until the pending map is empty,
    /// so edits scheduled while earlier slugs were being written are flushed
    /// too. Returns how many records were written.
    pub async fn flush_pending(&self) -> usize {
        let mut written = 0;
        loop {
            let slugs: Vec<Slug> = self.inner.lock_pending().keys().cloned().collect();
            if slugs.is_empty() {
                return written;
            }
            for slug in slugs {
                if self.inner.flush_slug(&slug, None).await {
                    written += 1;
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn has_pending(&self, slug: &Slug) -> bool {
        self.inner.lock_pending().contains_key(slug)
    }

    pub fn stats(&self) -> ReconcilerStats {
        let s = &self.inner.stats;
        ReconcilerStats {
            scheduled: s.scheduled.load(Ordering::Relaxed),
            coalesced: s.coalesced.load(Ordering::Relaxed),
            persisted: s.persisted.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Slug, PendingWrite>> {
        // Pending state stays consistent across a panicking holder: every
        // critical section is a single remove/insert.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<Slug, Arc<tokio::sync::Mutex<()>>>> {
        self.write_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the pending record for `slug` and write it.
    ///
    /// With `Some(generation)` the record is only taken if it is still the
    /// one that timer was armed for. Returns whether a write succeeded.
    async fn flush_slug(&self, slug: &Slug, generation: Option<u64>) -> bool {
        let gate = self.lock_gates().entry(slug.clone()).or_default().clone();
        let guard = gate.lock().await;
        let written = self.take_and_write(slug, generation).await;
        drop(guard);

        // Map plus our clone: nobody else is waiting on this slug
        let mut gates = self.lock_gates();
        if Arc::strong_count(&gate) == 2 {
            gates.remove(slug);
        }
        written
    }

    async fn take_and_write(&self, slug: &Slug, generation: Option<u64>) -> bool {
        let record = {
            let mut pending = self.lock_pending();
            match pending.get(slug) {
                Some(p) if generation.map_or(true, |g| g == p.generation) => pending.remove(slug),
                _ => None,
            }
        };
        let Some(record) = record else {
            return false;
        };
        if generation.is_none() {
            record.timer.abort();
        }

        match self.write(slug, record.content, record.language).await {
            Ok(doc) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Persisted {} ({} bytes, {})",
                    doc.slug,
                    doc.content.len(),
                    doc.language
                );
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist {slug}: {e}");
                false
            }
        }
    }

    async fn write(
        &self,
        slug: &Slug,
        content: String,
        language: Option<String>,
    ) -> Result<Document, StoreError> {
        let language = match language {
            Some(language) => language,
            None => match self.documents.get(slug).await {
                Ok(doc) => doc.language,
                Err(StoreError::NotFound(_)) => self.documents.default_language().to_string(),
                Err(e) => return Err(e),
            },
        };
        self.documents.update(slug, content, language).await
    }
}
