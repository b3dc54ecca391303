//! Control index: resolves identifiers to shards.
//!
//! Two layouts implement the same contract:
//!
//! - per-identifier: the index is itself a shard whose keys are
//!   identifiers and whose values are [`ControlRecord`]s pointing at each
//!   shard's own database under the cache dir
//! - shared: one database holds a namespace per identifier and no separate
//!   index exists
//!
//! Creating a shard is serialized by the creation mutex. A new shard is only
//! handed out after its control record has been written, so a crash between
//! the two steps leaves an unreferenced database rather than a shard whose
//! mapping was lost.

use crate::engine::{
    EngineConfig, EngineFactory, MemoryShard, ShardEngine, SharedDatabase, disambiguated_name,
};
use crate::tables;
use crate::types::ControlRecord;
use parking_lot::{Mutex, MutexGuard};
use replaycache_common::{EngineType, Identifier, Layout, Result, StoreConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opens the standalone shard stored at a path
pub type ShardOpener = Arc<dyn Fn(&Path) -> Result<Arc<dyn ShardEngine>> + Send + Sync>;

/// Proof that the creation mutex is held
pub struct CreationGuard<'a>(MutexGuard<'a, ()>);

enum Strategy {
    PerIdentifier {
        index: Arc<dyn ShardEngine>,
        root: PathBuf,
        engine: EngineType,
        opener: ShardOpener,
    },
    Shared {
        db: Box<dyn SharedDatabase>,
    },
}

/// Persistent identifier -> shard mapping
pub struct ControlIndex {
    strategy: Strategy,
    creation: Mutex<()>,
}

impl ControlIndex {
    /// Open the control index described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let engine_config = EngineConfig::from_store_config(config);
        let opener: ShardOpener =
            Arc::new(move |path: &Path| EngineFactory::open_shard(&engine_config, path));
        Self::with_opener(config, opener)
    }

    /// Open the control index, opening per-identifier shards with `opener`
    ///
    /// The shared layout ignores `opener`.
    pub fn with_opener(config: &StoreConfig, opener: ShardOpener) -> Result<Self> {
        config.validate()?;
        let engine_config = EngineConfig::from_store_config(config);

        let strategy = match config.layout {
            Layout::PerIdentifier => {
                let index_path = config.dir.join(tables::CONTROL_INDEX_NAME);
                // Records must never be evicted, whatever the shard capacity
                let index: Arc<dyn ShardEngine> = if config.engine.is_persistent() {
                    EngineFactory::open_shard(&engine_config, &index_path)?
                } else {
                    Arc::new(MemoryShard::unbounded(index_path.display().to_string()))
                };
                Strategy::PerIdentifier {
                    index,
                    root: config.dir.clone(),
                    engine: config.engine,
                    opener,
                }
            }
            Layout::Shared => Strategy::Shared {
                db: EngineFactory::open_shared(
                    &engine_config,
                    &config.dir.join(config.db_file_name()),
                )?,
            },
        };

        Ok(Self {
            strategy,
            creation: Mutex::new(()),
        })
    }

    /// Take the creation mutex
    pub fn lock_creation(&self) -> CreationGuard<'_> {
        CreationGuard(self.creation.lock())
    }

    /// Layout of this index
    pub const fn layout(&self) -> Layout {
        match self.strategy {
            Strategy::PerIdentifier { .. } => Layout::PerIdentifier,
            Strategy::Shared { .. } => Layout::Shared,
        }
    }

    /// Open the shard of a known identifier; `None` if it has none
    pub fn resolve(
        &self,
        _guard: &CreationGuard<'_>,
        identifier: &Identifier,
    ) -> Result<Option<Arc<dyn ShardEngine>>> {
        match &self.strategy {
            Strategy::PerIdentifier {
                index,
                root,
                opener,
                ..
            } => {
                let Some(bytes) = index.get_bytes_safe(identifier.as_str().as_bytes())? else {
                    return Ok(None);
                };
                let record = ControlRecord::decode(&bytes)?;
                let path = root.join(&record.shard_name);
                debug!("Opening shard for {} at {}", identifier, path.display());
                Ok(Some(opener(&path)?))
            }
            Strategy::Shared { db } => db.open_namespace(identifier),
        }
    }

    /// Open the shard of `identifier`, creating it on first reference
    pub fn resolve_or_create(
        &self,
        guard: &CreationGuard<'_>,
        identifier: &Identifier,
    ) -> Result<Arc<dyn ShardEngine>> {
        if let Some(shard) = self.resolve(guard, identifier)? {
            return Ok(shard);
        }

        match &self.strategy {
            Strategy::PerIdentifier {
                index,
                root,
                engine,
                opener,
            } => {
                let name = Self::claim_name(index, root, identifier)?;
                let path = root.join(&name);
                let shard = opener(&path)?;

                let record = ControlRecord::new(identifier.as_str(), name, *engine);
                let written = record
                    .encode()
                    .and_then(|bytes| index.set_bytes(identifier.as_str().as_bytes(), &bytes));
                if let Err(e) = written {
                    if let Err(close_err) = shard.close() {
                        warn!("Failed to close unrecorded shard for {}: {}", identifier, close_err);
                    }
                    return Err(e);
                }

                debug!("Created shard for {} at {}", identifier, path.display());
                Ok(shard)
            }
            Strategy::Shared { db } => db.create_namespace(identifier),
        }
    }

    /// Pick the shard name (relative to the cache dir) for a new shard
    ///
    /// A leftover database of the same identifier is reused. One recorded
    /// for a different identifier (e.g. the `https` twin of an `http` URL)
    /// forces a digest-suffixed name.
    fn claim_name(
        index: &Arc<dyn ShardEngine>,
        root: &Path,
        identifier: &Identifier,
    ) -> Result<String> {
        let name = identifier.shard_name();
        if !root.join(&name).exists() {
            return Ok(name);
        }
        for key in index.keys()? {
            let record = ControlRecord::decode(&index.get_bytes(&key)?)?;
            if record.shard_name == name && record.identifier != identifier.as_str() {
                return Ok(disambiguated_name(identifier));
            }
        }
        Ok(name)
    }

    /// Every identifier with a shard
    pub fn identifiers(&self) -> Result<Vec<String>> {
        match &self.strategy {
            Strategy::PerIdentifier { index, .. } => Ok(index
                .keys()?
                .into_iter()
                .map(|k| String::from_utf8_lossy(&k).into_owned())
                .collect()),
            Strategy::Shared { db } => db.namespaces(),
        }
    }

    /// Location of the control index or shared database
    pub fn location(&self) -> String {
        match &self.strategy {
            Strategy::PerIdentifier { index, .. } => index.db_file_name(),
            Strategy::Shared { db } => db.db_file_name(),
        }
    }

    /// Release the index; idempotent
    pub fn close(&self) -> Result<()> {
        match &self.strategy {
            Strategy::PerIdentifier { index, .. } => index.close(),
            Strategy::Shared { db } => db.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replaycache_common::Error;
    use tempfile::tempdir;

    fn id(s: &str) -> Identifier {
        Identifier::new(s).unwrap()
    }

    #[test]
    fn test_per_identifier_create_then_resolve() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::with_dir(dir.path());
        let control = ControlIndex::open(&config).unwrap();
        let guard = control.lock_creation();
        let identifier = id("http://example.com/test");

        assert!(control.resolve(&guard, &identifier).unwrap().is_none());

        let shard = control.resolve_or_create(&guard, &identifier).unwrap();
        assert_eq!(
            shard.db_file_name(),
            dir.path().join("ZXhhbXBsZS5jb20vdGVzdA").display().to_string()
        );
        shard.set_bytes(b"k", b"v").unwrap();
        shard.close().unwrap();

        let reopened = control.resolve(&guard, &identifier).unwrap().unwrap();
        assert_eq!(reopened.get_bytes(b"k").unwrap(), b"v");
        reopened.close().unwrap();

        assert_eq!(control.identifiers().unwrap(), vec![identifier.to_string()]);
        drop(guard);
        control.close().unwrap();
        control.close().unwrap();
    }

    #[test]
    fn test_mapping_survives_restart() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::with_dir(dir.path());
        let identifier = id("http://example.com/persist");
        {
            let control = ControlIndex::open(&config).unwrap();
            let guard = control.lock_creation();
            let shard = control.resolve_or_create(&guard, &identifier).unwrap();
            shard.set_bytes(b"k", b"v").unwrap();
            shard.close().unwrap();
            drop(guard);
            control.close().unwrap();
        }

        let control = ControlIndex::open(&config).unwrap();
        let guard = control.lock_creation();
        let shard = control.resolve(&guard, &identifier).unwrap().unwrap();
        assert_eq!(shard.get_bytes(b"k").unwrap(), b"v");
        shard.close().unwrap();
    }

    #[test]
    fn test_scheme_twins_get_separate_shards() {
        let dir = tempdir().unwrap();
        let control = ControlIndex::open(&StoreConfig::with_dir(dir.path())).unwrap();
        let guard = control.lock_creation();

        let http = control
            .resolve_or_create(&guard, &id("http://example.com/test"))
            .unwrap();
        let https = control
            .resolve_or_create(&guard, &id("https://example.com/test"))
            .unwrap();
        assert_ne!(http.db_file_name(), https.db_file_name());

        http.set_bytes(b"k", b"http").unwrap();
        https.set_bytes(b"k", b"https").unwrap();
        assert_eq!(http.get_bytes(b"k").unwrap(), b"http");
        http.close().unwrap();
        https.close().unwrap();
    }

    #[test]
    fn test_shared_layout_uses_namespaces() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::with_dir(dir.path()).with_layout(Layout::Shared);
        let control = ControlIndex::open(&config).unwrap();
        assert_eq!(control.layout(), Layout::Shared);
        assert_eq!(
            control.location(),
            dir.path().join("cache.redb").display().to_string()
        );

        let guard = control.lock_creation();
        let identifier = id("http://example.com/test");
        assert!(control.resolve(&guard, &identifier).unwrap().is_none());
        let shard = control.resolve_or_create(&guard, &identifier).unwrap();
        assert_eq!(shard.len().unwrap(), 0);
        assert!(!dir.path().join(tables::CONTROL_INDEX_NAME).exists());
        shard.close().unwrap();
    }

    #[test]
    fn test_mapping_follows_moved_cache_dir() {
        let dir = tempdir().unwrap();
        let old_dir = dir.path().join("old");
        let new_dir = dir.path().join("new");
        let identifier = id("http://example.com/test");
        {
            let control = ControlIndex::open(&StoreConfig::with_dir(&old_dir)).unwrap();
            let guard = control.lock_creation();
            let shard = control.resolve_or_create(&guard, &identifier).unwrap();
            shard.set_bytes(b"k", b"v").unwrap();
            shard.close().unwrap();
            drop(guard);
            control.close().unwrap();
        }
        std::fs::rename(&old_dir, &new_dir).unwrap();

        let control = ControlIndex::open(&StoreConfig::with_dir(&new_dir)).unwrap();
        let guard = control.lock_creation();
        let shard = control.resolve(&guard, &identifier).unwrap().unwrap();
        assert_eq!(shard.get_bytes(b"k").unwrap(), b"v");
        assert!(shard.db_file_name().starts_with(&new_dir.display().to_string()));
        assert!(!old_dir.exists());
        shard.close().unwrap();
    }

    #[test]
    fn test_memory_index_keeps_every_record() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::with_dir(dir.path()).with_engine(EngineType::InMemory);
        config.memory_capacity = 2;
        let control = ControlIndex::open(&config).unwrap();
        let guard = control.lock_creation();

        for i in 0..5 {
            let identifier = id(&format!("http://example.com/{i}"));
            control.resolve_or_create(&guard, &identifier).unwrap();
        }
        assert_eq!(control.identifiers().unwrap().len(), 5);
        assert!(control
            .resolve(&guard, &id("http://example.com/0"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_failed_shard_open_records_nothing() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::with_dir(dir.path());
        let opener: ShardOpener = Arc::new(|path: &Path| {
            Err(Error::EngineOpen {
                path: path.display().to_string(),
                reason: "permission denied".to_string(),
            })
        });
        let control = ControlIndex::with_opener(&config, opener).unwrap();
        let guard = control.lock_creation();

        let err = control
            .resolve_or_create(&guard, &id("http://example.com/test"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::EngineOpen { .. }));
        assert!(control.identifiers().unwrap().is_empty());
    }
}
