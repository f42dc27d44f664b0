//! Bounded in-memory cache of resolved entities.
//!
//! Keyed by canonical id, shared across workers under a lock. The cache is
//! advisory: entries are written only after the database commit succeeds,
//! and a stale entry is at worst a wasted lookup.

use crate::{EntityId, EntityMetadata, EntityRecord};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Cached slice of an entity row: enough to answer resolution without a
/// database round-trip.
#[derive(Debug, Clone)]
pub struct CachedEntity {
    pub id: EntityId,
    pub display_name: String,
    pub metadata: EntityMetadata,
}

impl From<&EntityRecord> for CachedEntity {
    fn from(record: &EntityRecord) -> Self {
        Self {
            id: record.id,
            display_name: record.display_name.clone(),
            metadata: record.metadata.clone(),
        }
    }
}

/// LRU over canonical id. Capacity zero disables the cache entirely
/// (legacy mode).
pub struct EntityCache {
    inner: Option<Mutex<LruCache<String, CachedEntity>>>,
}

impl EntityCache {
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { inner }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, canonical_id: &str) -> Option<CachedEntity> {
        let cache = self.inner.as_ref()?;
        cache.lock().get(canonical_id).cloned()
    }

    /// Insert or refresh an entry. Call only after the backing row is
    /// durable.
    pub fn put(&self, canonical_id: &str, entity: CachedEntity) {
        if let Some(cache) = self.inner.as_ref() {
            cache.lock().put(canonical_id.to_string(), entity);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|c| c.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(name: &str) -> CachedEntity {
        CachedEntity {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
            metadata: EntityMetadata::default(),
        }
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = EntityCache::new(0);
        assert!(!cache.enabled());
        cache.put("abc", entry("A"));
        assert!(cache.get("abc").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_returns_most_recent_put() {
        let cache = EntityCache::new(4);
        let first = entry("first");
        cache.put("k", first.clone());
        assert_eq!(cache.get("k").unwrap().id, first.id);

        let second = entry("second");
        cache.put("k", second.clone());
        assert_eq!(cache.get("k").unwrap().id, second.id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = EntityCache::new(2);
        cache.put("a", entry("a"));
        cache.put("b", entry("b"));
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get("a");
        cache.put("c", entry("c"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}
