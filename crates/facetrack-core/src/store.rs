//! Object store seam: where enrolled face records live.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Record kind under which enrolled faces are stored.
pub const FACE_KIND: &str = "face";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("no {kind} record with id {id}")]
    NotFound { kind: String, id: String },
    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A record as listed from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub record: serde_json::Value,
    /// RFC 3339 creation time, when the backend tracks it.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Named-record storage, fallible and asynchronous.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    async fn create(&self, kind: &str, record: serde_json::Value) -> Result<String, StoreError>;

    /// List up to `limit` records of `kind`, most recent first when `newest_first` is set.
    async fn list(
        &self,
        kind: &str,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<StoredObject>, StoreError>;

    async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError>;
}

impl<T: ObjectStore> ObjectStore for Arc<T> {
    async fn create(&self, kind: &str, record: serde_json::Value) -> Result<String, StoreError> {
        (**self).create(kind, record).await
    }

    async fn list(
        &self,
        kind: &str,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<StoredObject>, StoreError> {
        (**self).list(kind, limit, newest_first).await
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        (**self).delete(kind, id).await
    }
}

/// Process-local store, used for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: u64,
    objects: Vec<(String, StoredObject)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl ObjectStore for MemoryStore {
    async fn create(&self, kind: &str, record: serde_json::Value) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = format!("{kind}-{}", inner.next_id);
        inner.objects.push((
            kind.to_string(),
            StoredObject {
                id: id.clone(),
                record,
                created_at: Some(chrono::Utc::now().to_rfc3339()),
            },
        ));
        Ok(id)
    }

    async fn list(
        &self,
        kind: &str,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<StoredObject>, StoreError> {
        let inner = self.lock()?;
        let matching = inner.objects.iter().filter(|(k, _)| k == kind).map(|(_, o)| o);
        let listed = if newest_first {
            matching.rev().take(limit).cloned().collect()
        } else {
            matching.take(limit).cloned().collect()
        };
        Ok(listed)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let before = inner.objects.len();
        inner.objects.retain(|(k, o)| !(k == kind && o.id == id));
        if inner.objects.len() == before {
            return Err(StoreError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_lists_newest_first_with_limit() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            store.create(FACE_KIND, json!({ "name": name })).await.unwrap();
        }
        store.create("other", json!({ "name": "x" })).await.unwrap();

        let newest = store.list(FACE_KIND, 2, true).await.unwrap();
        let names: Vec<_> = newest.iter().map(|o| o.record["name"].clone()).collect();
        assert_eq!(names, vec![json!("c"), json!("b")]);

        let oldest = store.list(FACE_KIND, 10, false).await.unwrap();
        assert_eq!(oldest.len(), 3);
        assert_eq!(oldest[0].record["name"], json!("a"));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryStore::new();
        let id = store.create(FACE_KIND, json!({})).await.unwrap();
        store.delete(FACE_KIND, &id).await.unwrap();
        assert!(store.list(FACE_KIND, 10, true).await.unwrap().is_empty());
        assert!(matches!(
            store.delete(FACE_KIND, &id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
