//! Ordered shard engine backed by redb.
//!
//! Every operation runs in its own redb transaction, so a completed
//! `set_bytes` is visible to every later read of the same shard.

use super::{EngineCapabilities, ShardEngine, SharedDatabase, check_key};
use crate::tables;
use parking_lot::RwLock;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, TableHandle,
};
use replaycache_common::{EngineType, Error, Identifier, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

type EntriesTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Database::create(path).map_err(|e| Error::EngineOpen {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn compact(db: &mut Database, path: &Path) -> Result<()> {
    match db.compact() {
        Ok(compacted) => {
            debug!("Compacted {} (reclaimed: {})", path.display(), compacted);
            Ok(())
        }
        Err(e) => Err(Error::storage(format!(
            "compaction of {} failed: {}",
            path.display(),
            e
        ))),
    }
}

fn read_bytes(db: &Database, def: EntriesTable<'_>, key: &[u8]) -> Result<Vec<u8>> {
    let read_txn = db.begin_read().map_err(Error::storage)?;
    let table = read_txn.open_table(def).map_err(table_error)?;
    let value = table.get(key).map_err(Error::storage)?;
    value.map(|v| v.value().to_vec()).ok_or(Error::KeyNotFound)
}

fn write_bytes(
    db: &Database,
    def: EntriesTable<'_>,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let write_txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut table = write_txn.open_table(def).map_err(Error::storage)?;
        table.insert(key, value).map_err(Error::storage)?;
    }
    write_txn.commit().map_err(Error::storage)?;
    Ok(())
}

fn remove_key(db: &Database, def: EntriesTable<'_>, key: &[u8]) -> Result<()> {
    let write_txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut table = write_txn.open_table(def).map_err(Error::storage)?;
        table.remove(key).map_err(Error::storage)?;
    }
    write_txn.commit().map_err(Error::storage)?;
    Ok(())
}

fn count(db: &Database, def: EntriesTable<'_>) -> Result<usize> {
    let read_txn = db.begin_read().map_err(Error::storage)?;
    let table = read_txn.open_table(def).map_err(table_error)?;
    let len = table.len().map_err(Error::storage)?;
    usize::try_from(len).map_err(Error::storage)
}

fn all_keys(db: &Database, def: EntriesTable<'_>) -> Result<Vec<Vec<u8>>> {
    let read_txn = db.begin_read().map_err(Error::storage)?;
    let table = read_txn.open_table(def).map_err(table_error)?;
    let mut keys = Vec::new();
    for entry in table.iter().map_err(Error::storage)? {
        let entry = entry.map_err(Error::storage)?;
        keys.push(entry.0.value().to_vec());
    }
    Ok(keys)
}

fn table_error(e: TableError) -> Error {
    match e {
        TableError::TableDoesNotExist(name) => Error::NamespaceNotFound(name),
        other => Error::storage(other),
    }
}

/// Standalone shard: one redb file with a single entries table
pub struct RedbShard {
    path: PathBuf,
    db: RwLock<Option<Database>>,
    compact_on_close: bool,
}

impl RedbShard {
    /// Open (or create) the shard file at `path`
    pub fn open(path: impl AsRef<Path>, compact_on_close: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(Error::storage)?;
        {
            let _t = write_txn.open_table(tables::ENTRIES).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;

        debug!("Opened redb shard at {}", path.display());
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
            compact_on_close,
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard
            .as_ref()
            .ok_or_else(|| Error::EngineClosed(self.path.display().to_string()))?;
        f(db)
    }
}

impl ShardEngine for RedbShard {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine_type: EngineType::EmbeddedOrdered,
            persistent: true,
            compacts_on_close: self.compact_on_close,
            persists_on_close: false,
            evicts: false,
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_db(|db| read_bytes(db, tables::ENTRIES, key))
    }

    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_db(|db| write_bytes(db, tables::ENTRIES, key, value))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_db(|db| remove_key(db, tables::ENTRIES, key))
    }

    fn len(&self) -> Result<usize> {
        self.with_db(|db| count(db, tables::ENTRIES))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_db(|db| all_keys(db, tables::ENTRIES))
    }

    fn close(&self) -> Result<()> {
        let Some(mut db) = self.db.write().take() else {
            return Ok(());
        };
        let result = if self.compact_on_close {
            compact(&mut db, &self.path)
        } else {
            Ok(())
        };
        drop(db);
        debug!("Closed redb shard at {}", self.path.display());
        result
    }

    fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared redb file holding one table per identifier
pub struct RedbShared {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    compact_on_close: bool,
}

impl RedbShared {
    /// Open (or create) the shared database at `path`
    pub fn open(path: impl AsRef<Path>, compact_on_close: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path)?;
        debug!("Opened shared redb database at {}", path.display());
        Ok(Self {
            path,
            db: RwLock::new(Some(Arc::new(db))),
            compact_on_close,
        })
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| Error::EngineClosed(self.path.display().to_string()))
    }

    fn namespace(&self, db: Arc<Database>, identifier: &Identifier) -> Arc<dyn ShardEngine> {
        Arc::new(RedbNamespace {
            path: self.path.clone(),
            table: identifier.as_str().to_string(),
            db: RwLock::new(Some(db)),
        })
    }
}

impl SharedDatabase for RedbShared {
    fn engine_type(&self) -> EngineType {
        EngineType::EmbeddedOrdered
    }

    fn open_namespace(&self, identifier: &Identifier) -> Result<Option<Arc<dyn ShardEngine>>> {
        let db = self.database()?;
        let exists = {
            let read_txn = db.begin_read().map_err(Error::storage)?;
            let def: EntriesTable<'_> = TableDefinition::new(identifier.as_str());
            match read_txn.open_table(def) {
                Ok(_) => true,
                Err(TableError::TableDoesNotExist(_)) => false,
                Err(e) => return Err(Error::storage(e)),
            }
        };
        Ok(exists.then(|| self.namespace(db, identifier)))
    }

    fn create_namespace(&self, identifier: &Identifier) -> Result<Arc<dyn ShardEngine>> {
        let db = self.database()?;
        let write_txn = db.begin_write().map_err(Error::storage)?;
        {
            let def: EntriesTable<'_> = TableDefinition::new(identifier.as_str());
            let _t = write_txn.open_table(def).map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;
        debug!("Created namespace '{}' in {}", identifier, self.path.display());
        Ok(self.namespace(db, identifier))
    }

    fn namespaces(&self) -> Result<Vec<String>> {
        let db = self.database()?;
        let read_txn = db.begin_read().map_err(Error::storage)?;
        let tables = read_txn.list_tables().map_err(Error::storage)?;
        Ok(tables.map(|t| t.name().to_string()).collect())
    }

    fn close(&self) -> Result<()> {
        let Some(db) = self.db.write().take() else {
            return Ok(());
        };
        let result = match Arc::try_unwrap(db) {
            Ok(mut db) if self.compact_on_close => compact(&mut db, &self.path),
            Ok(_) => Ok(()),
            Err(_) => {
                // A namespace handle outlived the store; the file closes
                // when the last one is dropped.
                warn!(
                    "Shared database {} still referenced, skipping compaction",
                    self.path.display()
                );
                Ok(())
            }
        };
        debug!("Closed shared redb database at {}", self.path.display());
        result
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// One identifier's table inside a [`RedbShared`] database
pub struct RedbNamespace {
    path: PathBuf,
    table: String,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbNamespace {
    fn definition(&self) -> EntriesTable<'_> {
        TableDefinition::new(&self.table)
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| {
            Error::EngineClosed(format!("{}#{}", self.path.display(), self.table))
        })?;
        f(db)
    }
}

impl ShardEngine for RedbNamespace {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine_type: EngineType::EmbeddedOrdered,
            persistent: true,
            compacts_on_close: false,
            persists_on_close: false,
            evicts: false,
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.with_db(|db| read_bytes(db, self.definition(), key))
    }

    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_db(|db| write_bytes(db, self.definition(), key, value))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.with_db(|db| remove_key(db, self.definition(), key))
    }

    fn len(&self) -> Result<usize> {
        self.with_db(|db| count(db, self.definition()))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_db(|db| all_keys(db, self.definition()))
    }

    fn close(&self) -> Result<()> {
        // The shared file is owned by RedbShared
        self.db.write().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }

    fn db_file_name(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_shard_put_get_delete() {
        let dir = tempdir().unwrap();
        let shard = RedbShard::open(dir.path().join("nested/shard"), true).unwrap();

        assert!(matches!(shard.get_bytes(b"k"), Err(Error::KeyNotFound)));
        assert_eq!(shard.get_bytes_safe(b"k").unwrap(), None);

        shard.set_bytes(b"k", b"v1").unwrap();
        shard.set_bytes(b"k", b"v2").unwrap();
        assert_eq!(shard.get_bytes(b"k").unwrap(), b"v2");
        assert_eq!(shard.len().unwrap(), 1);
        assert_eq!(shard.keys().unwrap(), vec![b"k".to_vec()]);

        shard.delete(b"k").unwrap();
        shard.delete(b"k").unwrap();
        assert_eq!(shard.get_bytes_safe(b"k").unwrap(), None);
        assert!(shard.is_empty().unwrap());
    }

    #[test]
    fn test_shard_rejects_empty_key() {
        let dir = tempdir().unwrap();
        let shard = RedbShard::open(dir.path().join("shard"), false).unwrap();
        assert!(matches!(shard.set_bytes(b"", b"v"), Err(Error::InvalidArgument(_))));
        assert!(matches!(shard.get_bytes(b""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_shard_close_is_idempotent_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard");
        {
            let shard = RedbShard::open(&path, true).unwrap();
            shard.set_bytes(b"k", b"v").unwrap();
            shard.close().unwrap();
            shard.close().unwrap();
            assert!(shard.is_closed());
            assert!(matches!(shard.get_bytes(b"k"), Err(Error::EngineClosed(_))));
        }

        let reopened = RedbShard::open(&path, true).unwrap();
        assert_eq!(reopened.get_bytes(b"k").unwrap(), b"v");
        assert_eq!(reopened.db_file_name(), path.display().to_string());
    }

    #[test]
    fn test_shared_namespaces() {
        let dir = tempdir().unwrap();
        let shared = RedbShared::open(dir.path().join("cache.redb"), true).unwrap();
        let a = Identifier::new("http://example.com/a").unwrap();
        let b = Identifier::new("http://example.com/b").unwrap();

        assert!(shared.open_namespace(&a).unwrap().is_none());

        let ns_a = shared.create_namespace(&a).unwrap();
        ns_a.set_bytes(b"k", b"a").unwrap();
        let ns_b = shared.create_namespace(&b).unwrap();
        assert_eq!(ns_b.get_bytes_safe(b"k").unwrap(), None);
        assert_eq!(ns_a.len().unwrap(), 1);

        let again = shared.open_namespace(&a).unwrap().unwrap();
        assert_eq!(again.get_bytes(b"k").unwrap(), b"a");

        let mut names = shared.namespaces().unwrap();
        names.sort();
        assert_eq!(names, vec![a.to_string(), b.to_string()]);

        for ns in [ns_a, ns_b, again] {
            ns.close().unwrap();
        }
        shared.close().unwrap();
        shared.close().unwrap();
    }

    #[test]
    fn test_namespace_len_missing_table() {
        let dir = tempdir().unwrap();
        let shared = RedbShared::open(dir.path().join("cache.redb"), false).unwrap();
        let orphan = RedbNamespace {
            path: dir.path().join("cache.redb"),
            table: "http://never.created".to_string(),
            db: RwLock::new(Some(shared.database().unwrap())),
        };
        assert!(matches!(orphan.len(), Err(Error::NamespaceNotFound(_))));
        assert!(matches!(orphan.get_bytes(b"k"), Err(Error::NamespaceNotFound(_))));
    }
}
