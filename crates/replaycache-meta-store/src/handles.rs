//! Registry of open shard handles.
//!
//! Every operation holds the registry mutex only for the map access itself.
//! Opening and closing engines happens outside the lock, before `put` and
//! after `delete`; deciding whether an identifier is being created is the
//! control index's job, not this registry's.

use crate::engine::ShardEngine;
use parking_lot::Mutex;
use replaycache_common::Identifier;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe map of identifier -> open shard engine
#[derive(Default)]
pub struct ShardHandleCache {
    handles: Mutex<HashMap<Identifier, Arc<dyn ShardEngine>>>,
}

impl ShardHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<dyn ShardEngine>> {
        self.handles.lock().get(identifier).cloned()
    }

    /// Register an open shard, returning the handle it replaced
    pub fn put(
        &self,
        identifier: Identifier,
        engine: Arc<dyn ShardEngine>,
    ) -> Option<Arc<dyn ShardEngine>> {
        self.handles.lock().insert(identifier, engine)
    }

    /// Unregister a shard; the caller closes the returned handle
    pub fn delete(&self, identifier: &Identifier) -> Option<Arc<dyn ShardEngine>> {
        self.handles.lock().remove(identifier)
    }

    /// Snapshot of the registry; may be stale as soon as it is returned
    pub fn all(&self) -> HashMap<Identifier, Arc<dyn ShardEngine>> {
        self.handles.lock().clone()
    }

    /// Remove and return every handle
    pub fn drain(&self) -> HashMap<Identifier, Arc<dyn ShardEngine>> {
        std::mem::take(&mut *self.handles.lock())
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn clear(&self) {
        self.handles.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryShard;

    fn shard(name: &str) -> Arc<dyn ShardEngine> {
        Arc::new(MemoryShard::new(name, 8).unwrap())
    }

    fn id(s: &str) -> Identifier {
        Identifier::new(s).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let cache = ShardHandleCache::new();
        assert!(cache.is_empty());
        assert!(cache.get(&id("http://a")).is_none());

        assert!(cache.put(id("http://a"), shard("a")).is_none());
        let a = cache.get(&id("http://a")).unwrap();
        a.set_bytes(b"k", b"v").unwrap();

        // The registry hands out the same engine, not a copy
        let again = cache.get(&id("http://a")).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(cache.len(), 1);

        let removed = cache.delete(&id("http://a")).unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert!(cache.delete(&id("http://a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let cache = ShardHandleCache::new();
        cache.put(id("http://a"), shard("a"));
        cache.put(id("http://b"), shard("b"));

        let snapshot = cache.all();
        cache.clear();
        assert_eq!(snapshot.len(), 2);
        assert!(cache.is_empty());

        cache.put(id("http://c"), shard("c"));
        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained.contains_key(&id("http://c")));
        assert_eq!(cache.len(), 0);
    }
}
