//! Vigil store: local mirror of watched objects.
//!
//! The cache is split into a single [`CacheWriter`] owned by the informer and any number of
//! cloneable [`CacheReader`]s handed to workers. Every write publishes a fresh map through
//! `ArcSwap`, so readers never lock and never see a half-applied write.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};
use vigil_core::{ObjectKey, PodSnapshot};

type Map = FxHashMap<ObjectKey, Arc<PodSnapshot>>;

/// Create an empty cache and return its writer and a reader.
pub fn object_cache() -> (CacheWriter, CacheReader) {
    let map = Arc::new(ArcSwap::from_pointee(Map::default()));
    (CacheWriter { map: Arc::clone(&map) }, CacheReader { map })
}

/// Read-only view of the cache.
#[derive(Clone)]
pub struct CacheReader {
    map: Arc<ArcSwap<Map>>,
}

impl CacheReader {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<PodSnapshot>> { self.map.load().get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.map.load().contains_key(key) }

    pub fn len(&self) -> usize { self.map.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Sorted keys of the current contents.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.map.load().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

/// Exclusive write access. Not `Clone`; there is exactly one per cache.
pub struct CacheWriter {
    map: Arc<ArcSwap<Map>>,
}

impl CacheWriter {
    pub fn reader(&self) -> CacheReader { CacheReader { map: Arc::clone(&self.map) } }

    /// Insert or replace the snapshot for `key`. Returns the previous snapshot.
    pub fn put(&mut self, key: ObjectKey, snapshot: PodSnapshot) -> Option<Arc<PodSnapshot>> {
        let mut next = Map::clone(&self.map.load());
        let prev = next.insert(key, Arc::new(snapshot));
        self.publish(next);
        prev
    }

    /// Remove `key`. Returns the last known snapshot, if any.
    pub fn delete(&mut self, key: &ObjectKey) -> Option<Arc<PodSnapshot>> {
        let current = self.map.load();
        if !current.contains_key(key) { return None; }
        let mut next = Map::clone(&current);
        drop(current);
        let prev = next.remove(key);
        self.publish(next);
        prev
    }

    /// Replace the whole content with a relist.
    ///
    /// Returns the keys that were cached but are missing from `items`; those objects were
    /// deleted while the watch was not observing them. Items without a valid key are skipped.
    pub fn replace(&mut self, items: Vec<PodSnapshot>) -> Vec<ObjectKey> {
        let mut next = Map::with_capacity_and_hasher(items.len(), Default::default());
        for item in items {
            match item.key() {
                Ok(key) => { next.insert(key, Arc::new(item)); }
                Err(e) => warn!(error = %e, name = %item.name, "skipping relisted object without a key"),
            }
        }
        let listed: FxHashSet<&ObjectKey> = next.keys().collect();
        let mut stale: Vec<ObjectKey> = self
            .map
            .load()
            .keys()
            .filter(|k| !listed.contains(k))
            .cloned()
            .collect();
        stale.sort_unstable();
        debug!(listed = next.len(), stale = stale.len(), "cache replaced from relist");
        self.publish(next);
        stale
    }

    fn publish(&mut self, next: Map) {
        gauge!("vigil_cache_objects", next.len() as f64);
        self.map.store(Arc::new(next));
    }
}
