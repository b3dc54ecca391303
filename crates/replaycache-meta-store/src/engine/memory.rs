//! In-memory shard engine.
//!
//! Bounded by an entry count; the least recently used entry is evicted
//! once the shard is full. Nothing is written to disk.

use super::{EngineCapabilities, ShardEngine, check_key};
use crate::tables;
use lru::LruCache;
use parking_lot::Mutex;
use replaycache_common::{EngineType, Error, Result};
use std::num::NonZeroUsize;

/// LRU-bounded shard held in process memory
pub struct MemoryShard {
    name: String,
    entries: Mutex<Option<LruCache<Vec<u8>, Vec<u8>>>>,
}

impl MemoryShard {
    /// Create an empty shard holding at most `capacity` entries
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::configuration("memory shard capacity must be at least 1"))?;
        Ok(Self {
            name: name.into(),
            entries: Mutex::new(Some(LruCache::new(capacity))),
        })
    }

    /// Create an empty shard with no entry limit
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Some(LruCache::unbounded())),
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut LruCache<Vec<u8>, Vec<u8>>) -> T) -> Result<T> {
        let mut guard = self.entries.lock();
        let entries = guard
            .as_mut()
            .ok_or_else(|| Error::EngineClosed(self.name.clone()))?;
        Ok(f(entries))
    }
}

impl ShardEngine for MemoryShard {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine_type: EngineType::InMemory,
            persistent: false,
            compacts_on_close: false,
            persists_on_close: false,
            evicts: true,
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_entries(|entries| entries.get(key).cloned())?
            .ok_or(Error::KeyNotFound)
    }

    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_entries(|entries| {
            entries.put(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_entries(|entries| {
            entries.pop(key);
        })
    }

    fn len(&self) -> Result<usize> {
        self.with_entries(|entries| entries.len())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_entries(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
    }

    fn close(&self) -> Result<()> {
        self.entries.lock().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.entries.lock().is_none()
    }

    fn db_file_name(&self) -> String {
        tables::RAM.to_string()
    }
}
