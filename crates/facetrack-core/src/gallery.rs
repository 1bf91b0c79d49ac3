//! Time-bounded snapshot of the enrolled identities.
//!
//! The snapshot is rebuilt from the object store at most once per refresh
//! interval, never per frame. A rebuild either replaces the whole snapshot or
//! leaves the previous one in place.

use crate::clock::Clock;
use crate::registry::FaceRecord;
use crate::store::{ObjectStore, StoredObject, FACE_KIND};
use crate::types::{Embedding, EnrolledIdentity, DEFAULT_EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GallerySettings {
    pub refresh_interval_ms: u64,
    /// Maximum records fetched per rebuild.
    pub fetch_limit: usize,
    /// Descriptor length a record must have to enter the gallery.
    pub embedding_dim: usize,
}

impl Default for GallerySettings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000,
            fetch_limit: 100,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl GallerySettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Immutable, ordered view of the gallery at one point in time.
#[derive(Debug)]
pub struct GallerySnapshot {
    identities: Vec<EnrolledIdentity>,
    captured_at: Instant,
}

impl GallerySnapshot {
    pub fn new(identities: Vec<EnrolledIdentity>, captured_at: Instant) -> Self {
        Self {
            identities,
            captured_at,
        }
    }

    pub fn identities(&self) -> &[EnrolledIdentity] {
        &self.identities
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

pub struct GalleryCache<S> {
    store: S,
    settings: GallerySettings,
    clock: Arc<dyn Clock>,
    snapshot: Option<Arc<GallerySnapshot>>,
    last_attempt: Option<Instant>,
    stale: bool,
}

impl<S: ObjectStore> GalleryCache<S> {
    pub fn new(store: S, settings: GallerySettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            settings,
            clock,
            snapshot: None,
            last_attempt: None,
            stale: false,
        }
    }

    /// The current snapshot, rebuilding it first when it is missing or expired.
    pub async fn current(&mut self) -> Option<Arc<GallerySnapshot>> {
        let now = self.clock.now();
        if self.needs_rebuild(now) {
            self.rebuild(now).await;
        }
        self.snapshot.clone()
    }

    /// The snapshot as it stands, without touching the store.
    pub fn peek(&self) -> Option<Arc<GallerySnapshot>> {
        self.snapshot.clone()
    }

    /// Force a rebuild on the next [`current`](Self::current) call.
    pub fn invalidate(&mut self) {
        self.stale = true;
        self.last_attempt = None;
    }

    pub fn settings(&self) -> &GallerySettings {
        &self.settings
    }

    fn needs_rebuild(&self, now: Instant) -> bool {
        let interval = self.settings.refresh_interval();
        let fresh = !self.stale
            && self
                .snapshot
                .as_ref()
                .is_some_and(|s| now.saturating_duration_since(s.captured_at()) <= interval);
        if fresh {
            return false;
        }
        // Failed attempts are retried at most once per interval.
        self.last_attempt
            .map_or(true, |t| now.saturating_duration_since(t) > interval)
    }

    async fn rebuild(&mut self, now: Instant) {
        self.last_attempt = Some(now);

        let objects = match self
            .store
            .list(FACE_KIND, self.settings.fetch_limit, true)
            .await
        {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!(error = %e, "gallery fetch failed; keeping previous snapshot");
                return;
            }
        };

        let fetched = objects.len();
        let identities: Vec<EnrolledIdentity> = objects
            .iter()
            .filter_map(|obj| identity_from_object(obj, self.settings.embedding_dim))
            .collect();

        if identities.is_empty() {
            if fetched == 0 && self.stale {
                // Invalidated after the last record was removed.
                tracing::debug!("gallery emptied");
                self.snapshot = None;
                self.stale = false;
            } else if fetched > 0 {
                tracing::warn!(fetched, "no usable gallery records; keeping previous snapshot");
            } else {
                tracing::debug!("gallery is empty");
            }
            return;
        }

        tracing::debug!(fetched, usable = identities.len(), "gallery snapshot rebuilt");
        self.snapshot = Some(Arc::new(GallerySnapshot::new(identities, now)));
        self.stale = false;
    }
}

fn identity_from_object(obj: &StoredObject, dim: usize) -> Option<EnrolledIdentity> {
    let record: FaceRecord = serde_json::from_value(obj.record.clone()).ok()?;
    let name = record.name.trim();
    if name.is_empty() {
        return None;
    }
    let embedding = Embedding::new(record.descriptor?);
    if !embedding.is_well_formed(dim) {
        tracing::trace!(id = %obj.id, len = embedding.len(), "dropping malformed descriptor");
        return None;
    }
    Some(EnrolledIdentity {
        name: name.to_string(),
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIM: usize = 4;

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        lists: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ObjectStore for CountingStore {
        async fn create(&self, kind: &str, record: serde_json::Value) -> Result<String, StoreError> {
            self.inner.create(kind, record).await
        }

        async fn list(
            &self,
            kind: &str,
            limit: usize,
            newest_first: bool,
        ) -> Result<Vec<StoredObject>, StoreError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("offline".into()));
            }
            self.inner.list(kind, limit, newest_first).await
        }

        async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete(kind, id).await
        }
    }

    fn settings() -> GallerySettings {
        GallerySettings {
            embedding_dim: DIM,
            ..Default::default()
        }
    }

    async fn cache_with(
        records: Vec<serde_json::Value>,
    ) -> (GalleryCache<Arc<CountingStore>>, Arc<CountingStore>, Arc<ManualClock>) {
        let store = Arc::new(CountingStore::default());
        for record in records {
            store.create(FACE_KIND, record).await.unwrap();
        }
        let clock = Arc::new(ManualClock::new());
        let cache = GalleryCache::new(store.clone(), settings(), clock.clone());
        (cache, store, clock)
    }

    #[tokio::test]
    async fn test_refresh_interval_limits_fetches() {
        let (mut cache, store, clock) =
            cache_with(vec![json!({ "name": "alice", "descriptor": [0.0, 0.0, 0.0, 1.0] })]).await;

        assert_eq!(cache.current().await.unwrap().len(), 1);
        clock.advance(Duration::from_millis(500));
        cache.current().await;
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(501));
        cache.current().await;
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_records_are_filtered() {
        let (mut cache, _, _) = cache_with(vec![
            json!({ "name": "ok", "descriptor": [0.1, 0.2, 0.3, 0.4] }),
            json!({ "name": "short", "descriptor": [0.1, 0.2] }),
            json!({ "name": "missing" }),
            json!({ "name": "", "descriptor": [0.1, 0.2, 0.3, 0.4] }),
            json!({ "name": "strings", "descriptor": ["a", "b", "c", "d"] }),
        ])
        .await;

        let snapshot = cache.current().await.unwrap();
        let names: Vec<_> = snapshot.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let (mut cache, store, clock) =
            cache_with(vec![json!({ "name": "alice", "descriptor": [1.0, 0.0, 0.0, 0.0] })]).await;
        let first = cache.current().await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_millis(1500));
        let after = cache.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &after));
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);

        // The failed attempt is not retried until another interval passes.
        clock.advance(Duration::from_millis(10));
        cache.current().await;
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_listing_keeps_previous_snapshot() {
        let (mut cache, store, clock) =
            cache_with(vec![json!({ "name": "alice", "descriptor": [1.0, 0.0, 0.0, 0.0] })]).await;
        let first = cache.current().await.unwrap();

        let id = store.list(FACE_KIND, 10, true).await.unwrap().remove(0).id;
        store.delete(FACE_KIND, &id).await.unwrap();
        clock.advance(Duration::from_millis(1500));

        let after = cache.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &after));
    }

    #[tokio::test]
    async fn test_empty_store_yields_no_snapshot() {
        let (mut cache, _, _) = cache_with(vec![]).await;
        assert!(cache.current().await.is_none());
        assert!(cache.peek().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_after_last_removal_clears_snapshot() {
        let (mut cache, store, _) =
            cache_with(vec![json!({ "name": "alice", "descriptor": [1.0, 0.0, 0.0, 0.0] })]).await;
        assert!(cache.current().await.is_some());

        let id = store.list(FACE_KIND, 10, true).await.unwrap().remove(0).id;
        store.delete(FACE_KIND, &id).await.unwrap();
        cache.invalidate();

        assert!(cache.current().await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let (mut cache, store, _) =
            cache_with(vec![json!({ "name": "alice", "descriptor": [1.0, 0.0, 0.0, 0.0] })]).await;
        cache.current().await;

        store
            .create(FACE_KIND, json!({ "name": "bob", "descriptor": [0.0, 1.0, 0.0, 0.0] }))
            .await
            .unwrap();
        cache.invalidate();

        let snapshot = cache.current().await.unwrap();
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);
        // Newest first.
        assert_eq!(snapshot.identities()[0].name, "bob");
        assert_eq!(snapshot.identities()[1].name, "alice");
    }
}
