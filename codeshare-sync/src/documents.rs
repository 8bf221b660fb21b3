//! Request/response document API over a `DocumentStore`.
//!
//! All calls hop onto tokio's blocking pool, so a slow backend only stalls
//! the task that asked.

use std::sync::Arc;

use crate::protocol::Slug;
use crate::storage::{Document, DocumentStore, StoreError};

/// Cheap-to-clone handle for get / create / update.
#[derive(Clone)]
pub struct DocumentApi {
    store: Arc<dyn DocumentStore>,
    default_language: Arc<str>,
}

impl DocumentApi {
    pub fn new(store: Arc<dyn DocumentStore>, default_language: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            default_language: default_language.into(),
        }
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// `GET document(slug)`; `StoreError::NotFound` for an unknown slug.
    pub async fn get(&self, slug: &Slug) -> Result<Document, StoreError> {
        let store = self.store.clone();
        let slug = slug.clone();
        tokio::task::spawn_blocking(move || store.get(&slug)).await?
    }

    /// `CREATE document(slug, content?, language?)`.
    ///
    /// Idempotent: an existing document is returned unchanged. Two callers
    /// racing on a new slug both get the single stored record.
    pub async fn create(
        &self,
        slug: &Slug,
        content: Option<String>,
        language: Option<String>,
    ) -> Result<Document, StoreError> {
        let store = self.store.clone();
        let candidate = Document::new(
            slug.clone(),
            content.unwrap_or_default(),
            language.unwrap_or_else(|| self.default_language.to_string()),
        );
        tokio::task::spawn_blocking(move || create_blocking(store.as_ref(), candidate)).await?
    }

    /// Fetch-or-create with empty content and the default language.
    pub async fn fetch_or_create(&self, slug: &Slug) -> Result<Document, StoreError> {
        self.create(slug, None, None).await
    }

    /// `UPDATE document(slug, content, language)`, last writer wins.
    pub async fn update(
        &self,
        slug: &Slug,
        content: String,
        language: String,
    ) -> Result<Document, StoreError> {
        let store = self.store.clone();
        let slug = slug.clone();
        tokio::task::spawn_blocking(move || store.upsert(&slug, &content, &language)).await?
    }
}

/// get → insert-if-absent → read back if the insert lost a race.
fn create_blocking(store: &dyn DocumentStore, candidate: Document) -> Result<Document, StoreError> {
    match store.get(&candidate.slug) {
        Ok(existing) => return Ok(existing),
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    if store.insert_if_absent(&candidate)? {
        log::info!("Created document {}", candidate.slug);
        Ok(candidate)
    } else {
        log::debug!("Lost create race for {}, reading winner", candidate.slug);
        store.get(&candidate.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, DEFAULT_LANGUAGE};

    fn slug(s: &str) -> Slug {
        Slug::parse(s).unwrap()
    }

    fn api() -> DocumentApi {
        DocumentApi::new(Arc::new(MemoryStore::new()), DEFAULT_LANGUAGE)
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let err = api().get(&slug("ghost")).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(slug("ghost")));
    }

    #[tokio::test]
    async fn test_fetch_or_create_defaults() {
        let doc = api().fetch_or_create(&slug("abc123")).await.unwrap();
        assert_eq!(doc.content, "");
        assert_eq!(doc.language, "javascript");
    }

    #[tokio::test]
    async fn test_fetch_or_create_idempotent() {
        let api = api();
        let first = api.fetch_or_create(&slug("abc123")).await.unwrap();
        let second = api.fetch_or_create(&slug("abc123")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_never_overwrites() {
        let api = api();
        api.create(&slug("abc"), Some("original".into()), Some("python".into()))
            .await
            .unwrap();
        let again = api
            .create(&slug("abc"), Some("replacement".into()), Some("rust".into()))
            .await
            .unwrap();
        assert_eq!(again.content, "original");
        assert_eq!(again.language, "python");
    }

    #[tokio::test]
    async fn test_update_then_get() {
        let api = api();
        api.fetch_or_create(&slug("abc")).await.unwrap();
        api.update(&slug("abc"), "x = 1".into(), "python".into())
            .await
            .unwrap();
        let doc = api.get(&slug("abc")).await.unwrap();
        assert_eq!((doc.content.as_str(), doc.language.as_str()), ("x = 1", "python"));
    }

    #[tokio::test]
    async fn test_concurrent_fetch_or_create_single_row() {
        let store = Arc::new(MemoryStore::new());
        let api = DocumentApi::new(store.clone(), DEFAULT_LANGUAGE);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.fetch_or_create(&slug("brand-new")).await })
            })
            .collect();

        let mut docs = Vec::new();
        for task in tasks {
            docs.push(task.await.unwrap().unwrap());
        }
        assert!(docs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len(), 1);
    }
}
