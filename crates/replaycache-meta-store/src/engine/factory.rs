//! Engine factory for creating shard storage engines
//!
//! Engine tuning travels in an explicit [`EngineConfig`] instead of process
//! wide settings, so two stores in one process can run different engines.

use super::{
    FjallShard, FjallShared, MemoryShard, RedbShard, RedbShared, ShardEngine, SharedDatabase,
};
use replaycache_common::{EngineType, Error, Result, StoreConfig};
use std::path::Path;
use std::sync::Arc;

/// Configuration for creating an engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Engine type
    pub engine_type: EngineType,
    /// Entry limit per shard (memory engine)
    pub memory_capacity: usize,
    /// Block cache size in bytes (LSM engine)
    pub lsm_cache_size: u64,
    /// Reclaim space when a shard is closed (ordered engine)
    pub compact_on_close: bool,
}

impl EngineConfig {
    /// Create a configuration with default tuning for `engine_type`
    pub fn new(engine_type: EngineType) -> Self {
        Self::from_store_config(&StoreConfig::default().with_engine(engine_type))
    }

    /// Take the engine settings out of a store configuration
    pub fn from_store_config(config: &StoreConfig) -> Self {
        Self {
            engine_type: config.engine,
            memory_capacity: config.memory_capacity,
            lsm_cache_size: config.lsm_cache_size,
            compact_on_close: config.compact_on_close,
        }
    }

    /// Set the compaction behaviour
    #[must_use]
    pub const fn with_compaction(mut self, compact_on_close: bool) -> Self {
        self.compact_on_close = compact_on_close;
        self
    }
}

/// Factory for creating shard engines
pub struct EngineFactory;

impl EngineFactory {
    /// Open (or create) a standalone shard at `path`
    ///
    /// # Returns
    /// Arc-wrapped engine implementing `ShardEngine`
    pub fn open_shard(config: &EngineConfig, path: &Path) -> Result<Arc<dyn ShardEngine>> {
        match config.engine_type {
            EngineType::EmbeddedOrdered => {
                Ok(Arc::new(RedbShard::open(path, config.compact_on_close)?))
            }
            EngineType::EmbeddedLsm => Ok(Arc::new(FjallShard::open(path, config.lsm_cache_size)?)),
            EngineType::InMemory => Ok(Arc::new(MemoryShard::new(
                path.display().to_string(),
                config.memory_capacity,
            )?)),
        }
    }

    /// Open (or create) a shared database with a namespace per identifier
    pub fn open_shared(config: &EngineConfig, path: &Path) -> Result<Box<dyn SharedDatabase>> {
        match config.engine_type {
            EngineType::EmbeddedOrdered => {
                Ok(Box::new(RedbShared::open(path, config.compact_on_close)?))
            }
            EngineType::EmbeddedLsm => {
                Ok(Box::new(FjallShared::open(path, config.lsm_cache_size)?))
            }
            EngineType::InMemory => Err(Error::configuration(
                "the in-memory engine has no shared database",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_factory_opens_each_engine() {
        let dir = tempdir().unwrap();
        for engine_type in [
            EngineType::EmbeddedOrdered,
            EngineType::EmbeddedLsm,
            EngineType::InMemory,
        ] {
            let config = EngineConfig::new(engine_type);
            let shard = EngineFactory::open_shard(&config, &dir.path().join(engine_type.name()))
                .unwrap();
            assert_eq!(shard.capabilities().engine_type, engine_type);
            assert_eq!(shard.capabilities().persistent, engine_type.is_persistent());

            shard.set_bytes(b"k", b"v").unwrap();
            assert_eq!(shard.get_bytes(b"k").unwrap(), b"v");
            shard.close().unwrap();
        }
    }

    #[test]
    fn test_close_capabilities() {
        let dir = tempdir().unwrap();
        let redb = EngineFactory::open_shard(
            &EngineConfig::new(EngineType::EmbeddedOrdered),
            &dir.path().join("redb"),
        )
        .unwrap();
        let caps = redb.capabilities();
        assert!(caps.compacts_on_close);
        assert!(!caps.persists_on_close);

        let fjall = EngineFactory::open_shard(
            &EngineConfig::new(EngineType::EmbeddedLsm),
            &dir.path().join("fjall"),
        )
        .unwrap();
        let caps = fjall.capabilities();
        assert!(!caps.compacts_on_close);
        assert!(caps.persists_on_close);

        let memory =
            EngineFactory::open_shard(&EngineConfig::new(EngineType::InMemory), dir.path())
                .unwrap();
        let caps = memory.capabilities();
        assert!(!caps.compacts_on_close && !caps.persists_on_close && caps.evicts);

        for shard in [redb, fjall, memory] {
            shard.close().unwrap();
        }
    }

    #[test]
    fn test_factory_shared_requires_persistent_engine() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(EngineType::InMemory);
        assert!(matches!(
            EngineFactory::open_shared(&config, &dir.path().join("cache")),
            Err(Error::Configuration(_))
        ));

        let config = EngineConfig::new(EngineType::EmbeddedOrdered);
        let shared = EngineFactory::open_shared(&config, &dir.path().join("cache.redb")).unwrap();
        assert_eq!(shared.engine_type(), EngineType::EmbeddedOrdered);
        shared.close().unwrap();
    }
}
