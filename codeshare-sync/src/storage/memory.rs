//! In-process document store, used when no storage path is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{unix_now, Document, DocumentStore, StoreError};
use crate::protocol::Slug;

/// `BTreeMap` behind a lock. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<Slug, Document>>,
    upserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts applied since creation.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl DocumentStore for MemoryStore {
    fn get(&self, slug: &Slug) -> Result<Document, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        docs.get(slug)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(slug.clone()))
    }

    fn insert_if_absent(&self, doc: &Document) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        if docs.contains_key(&doc.slug) {
            return Ok(false);
        }
        docs.insert(doc.slug.clone(), doc.clone());
        Ok(true)
    }

    fn upsert(&self, slug: &Slug, content: &str, language: &str) -> Result<Document, StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .entry(slug.clone())
            .or_insert_with(|| Document::empty(slug.clone(), language));
        doc.content = content.to_string();
        doc.language = language.to_string();
        doc.updated_at = unix_now();
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(doc.clone())
    }

    fn list_slugs(&self) -> Result<Vec<Slug>, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.keys().cloned().collect())
    }
}
