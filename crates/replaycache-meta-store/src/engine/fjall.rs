//! LSM shard engine backed by fjall.
//!
//! Partition names may only use a restricted character set, so shared
//! keyspaces name each identifier's partition after its shard name and keep
//! an identifier -> partition catalog alongside.

use super::{EngineCapabilities, ShardEngine, SharedDatabase, check_key, disambiguated_name};
use crate::tables;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;
use replaycache_common::{EngineType, Error, Identifier, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

fn open_keyspace(path: &Path, cache_size: u64) -> Result<Keyspace> {
    std::fs::create_dir_all(path)?;
    fjall::Config::new(path)
        .cache_size(cache_size)
        .open()
        .map_err(|e| Error::EngineOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn open_partition(keyspace: &Keyspace, name: &str) -> Result<PartitionHandle> {
    keyspace
        .open_partition(name, PartitionCreateOptions::default())
        .map_err(Error::storage)
}

fn persist(keyspace: &Keyspace, path: &Path) -> Result<()> {
    keyspace.persist(PersistMode::SyncAll).map_err(|e| {
        Error::storage(format!("persisting {} failed: {}", path.display(), e))
    })
}

fn read_bytes(partition: &PartitionHandle, key: &[u8]) -> Result<Vec<u8>> {
    match partition.get(key).map_err(Error::storage)? {
        Some(value) => Ok(value.to_vec()),
        None => Err(Error::KeyNotFound),
    }
}

fn all_keys(partition: &PartitionHandle) -> Result<Vec<Vec<u8>>> {
    partition
        .iter()
        .map(|entry| entry.map(|(k, _)| k.to_vec()).map_err(Error::storage))
        .collect()
}

/// Standalone shard: one fjall keyspace with a single entries partition
pub struct FjallShard {
    path: PathBuf,
    inner: RwLock<Option<(Keyspace, PartitionHandle)>>,
}

impl FjallShard {
    /// Open (or create) the shard keyspace at `path`
    pub fn open(path: impl AsRef<Path>, cache_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let keyspace = open_keyspace(&path, cache_size)?;
        let entries = open_partition(&keyspace, tables::ENTRIES_PARTITION)?;
        debug!("Opened fjall shard at {}", path.display());
        Ok(Self {
            path,
            inner: RwLock::new(Some((keyspace, entries))),
        })
    }

    fn with_partition<T>(&self, f: impl FnOnce(&PartitionHandle) -> Result<T>) -> Result<T> {
        let guard = self.inner.read();
        let (_, entries) = guard
            .as_ref()
            .ok_or_else(|| Error::EngineClosed(self.path.display().to_string()))?;
        f(entries)
    }
}

impl ShardEngine for FjallShard {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine_type: EngineType::EmbeddedLsm,
            persistent: true,
            compacts_on_close: false,
            persists_on_close: true,
            evicts: false,
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_partition(|p| read_bytes(p, key))
    }

    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_partition(|p| p.insert(key, value).map_err(Error::storage))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_partition(|p| p.remove(key).map_err(Error::storage))
    }

    fn len(&self) -> Result<usize> {
        self.with_partition(|p| p.len().map_err(Error::storage))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_partition(all_keys)
    }

    fn close(&self) -> Result<()> {
        let Some((keyspace, entries)) = self.inner.write().take() else {
            return Ok(());
        };
        let result = persist(&keyspace, &self.path);
        drop(entries);
        drop(keyspace);
        debug!("Closed fjall shard at {}", self.path.display());
        result
    }

    fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared fjall keyspace holding one partition per identifier
pub struct FjallShared {
    path: PathBuf,
    inner: RwLock<Option<(Keyspace, PartitionHandle)>>,
}

impl FjallShared {
    /// Open (or create) the shared keyspace at `path`
    pub fn open(path: impl AsRef<Path>, cache_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let keyspace = open_keyspace(&path, cache_size)?;
        let catalog = open_partition(&keyspace, tables::NAMESPACE_CATALOG)?;
        debug!("Opened shared fjall keyspace at {}", path.display());
        Ok(Self {
            path,
            inner: RwLock::new(Some((keyspace, catalog))),
        })
    }

    fn state(&self) -> Result<(Keyspace, PartitionHandle)> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| Error::EngineClosed(self.path.display().to_string()))
    }

    fn namespace(&self, partition: PartitionHandle, name: &str) -> Arc<dyn ShardEngine> {
        Arc::new(FjallNamespace {
            label: format!("{}#{}", self.path.display(), name),
            path: self.path.clone(),
            partition: RwLock::new(Some(partition)),
        })
    }
}

impl SharedDatabase for FjallShared {
    fn engine_type(&self) -> EngineType {
        EngineType::EmbeddedLsm
    }

    fn open_namespace(&self, identifier: &Identifier) -> Result<Option<Arc<dyn ShardEngine>>> {
        let (keyspace, catalog) = self.state()?;
        let Some(name) = catalog
            .get(identifier.as_str().as_bytes())
            .map_err(Error::storage)?
        else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&name).into_owned();
        if !keyspace.partition_exists(&name) {
            return Ok(None);
        }
        let partition = open_partition(&keyspace, &name)?;
        Ok(Some(self.namespace(partition, &name)))
    }

    fn create_namespace(&self, identifier: &Identifier) -> Result<Arc<dyn ShardEngine>> {
        if let Some(existing) = self.open_namespace(identifier)? {
            return Ok(existing);
        }

        let (keyspace, catalog) = self.state()?;
        let mut name = identifier.shard_name();
        if keyspace.partition_exists(&name) {
            name = disambiguated_name(identifier);
        }
        let partition = open_partition(&keyspace, &name)?;
        catalog
            .insert(identifier.as_str().as_bytes(), name.as_bytes())
            .map_err(Error::storage)?;
        debug!("Created partition '{}' for {}", name, identifier);
        Ok(self.namespace(partition, &name))
    }

    fn namespaces(&self) -> Result<Vec<String>> {
        let (_, catalog) = self.state()?;
        Ok(all_keys(&catalog)?
            .into_iter()
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    fn close(&self) -> Result<()> {
        let Some((keyspace, catalog)) = self.inner.write().take() else {
            return Ok(());
        };
        let result = persist(&keyspace, &self.path);
        drop(catalog);
        drop(keyspace);
        debug!("Closed shared fjall keyspace at {}", self.path.display());
        result
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// One identifier's partition inside a [`FjallShared`] keyspace
pub struct FjallNamespace {
    label: String,
    path: PathBuf,
    partition: RwLock<Option<PartitionHandle>>,
}

impl FjallNamespace {
    fn with_partition<T>(&self, f: impl FnOnce(&PartitionHandle) -> Result<T>) -> Result<T> {
        let guard = self.partition.read();
        let partition = guard
            .as_ref()
            .ok_or_else(|| Error::EngineClosed(self.label.clone()))?;
        f(partition)
    }
}

impl ShardEngine for FjallNamespace {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine_type: EngineType::EmbeddedLsm,
            persistent: true,
            compacts_on_close: false,
            persists_on_close: false,
            evicts: false,
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_partition(|p| read_bytes(p, key))
    }

    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_partition(|p| p.insert(key, value).map_err(Error::storage))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_partition(|p| p.remove(key).map_err(Error::storage))
    }

    fn len(&self) -> Result<usize> {
        self.with_partition(|p| p.len().map_err(Error::storage))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_partition(all_keys)
    }

    fn close(&self) -> Result<()> {
        // The keyspace is persisted and released by FjallShared
        self.partition.write().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.partition.read().is_none()
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CACHE_SIZE: u64 = 1024 * 1024;

    #[test]
    fn test_shard_put_get_delete() {
        let dir = tempdir().unwrap();
        let shard = FjallShard::open(dir.path().join("shard"), CACHE_SIZE).unwrap();

        assert!(matches!(shard.get_bytes(b"k"), Err(Error::KeyNotFound)));
        shard.set_bytes(b"k", b"v1").unwrap();
        shard.set_bytes(b"k", b"v2").unwrap();
        assert_eq!(shard.get_bytes_safe(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(shard.len().unwrap(), 1);

        shard.delete(b"k").unwrap();
        shard.delete(b"missing").unwrap();
        assert_eq!(shard.get_bytes_safe(b"k").unwrap(), None);
        assert!(matches!(shard.set_bytes(b"", b"v"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_shard_reopen_after_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard");
        {
            let shard = FjallShard::open(&path, CACHE_SIZE).unwrap();
            shard.set_bytes(b"k", b"v").unwrap();
            shard.close().unwrap();
            shard.close().unwrap();
            assert!(matches!(shard.len(), Err(Error::EngineClosed(_))));
        }

        let reopened = FjallShard::open(&path, CACHE_SIZE).unwrap();
        assert_eq!(reopened.get_bytes(b"k").unwrap(), b"v");
        reopened.close().unwrap();
    }

    #[test]
    fn test_shared_partitions() {
        let dir = tempdir().unwrap();
        let shared = FjallShared::open(dir.path().join("cache.fjall"), CACHE_SIZE).unwrap();
        let http = Identifier::new("http://example.com/test").unwrap();
        let https = Identifier::new("https://example.com/test").unwrap();

        assert!(shared.open_namespace(&http).unwrap().is_none());

        let a = shared.create_namespace(&http).unwrap();
        let b = shared.create_namespace(&https).unwrap();
        a.set_bytes(b"k", b"http").unwrap();
        b.set_bytes(b"k", b"https").unwrap();
        assert_eq!(a.get_bytes(b"k").unwrap(), b"http");
        assert_eq!(b.get_bytes(b"k").unwrap(), b"https");

        let again = shared.open_namespace(&http).unwrap().unwrap();
        assert_eq!(again.len().unwrap(), 1);

        let mut names = shared.namespaces().unwrap();
        names.sort();
        assert_eq!(names, vec![http.to_string(), https.to_string()]);

        a.close().unwrap();
        assert!(a.is_closed());
        shared.close().unwrap();
        shared.close().unwrap();
        assert!(matches!(shared.namespaces(), Err(Error::EngineClosed(_))));
    }
}
