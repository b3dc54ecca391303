//! Shard storage engine abstraction
//!
//! A shard is one independent key-value namespace holding every recorded
//! response for a single identifier. This module provides a trait-based
//! abstraction over the embedded databases that can back a shard, with the
//! concrete engine selected once at construction through [`EngineFactory`].
//!
//! # Engines
//!
//! - `redb`: ordered B-tree store, one file per shard or one table per
//!   identifier in a shared file
//! - `fjall`: LSM-tree store, one keyspace per shard or one partition per
//!   identifier in a shared keyspace
//! - `memory`: bounded LRU map, nothing survives a restart
//!
//! Keys are never empty; every engine rejects an empty key with
//! `InvalidArgument`. Entries have no expiry; only the memory engine evicts.

pub mod factory;
pub mod fjall;
pub mod memory;
pub mod redb;

use replaycache_common::{EngineType, Error, Identifier, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Capabilities of a shard engine
#[derive(Clone, Debug)]
pub struct EngineCapabilities {
    /// Engine this shard runs on
    pub engine_type: EngineType,
    /// Data survives a process restart
    pub persistent: bool,
    /// Close compacts the database file to reclaim space
    pub compacts_on_close: bool,
    /// Close flushes buffered writes (journal) to disk
    pub persists_on_close: bool,
    /// Old entries may be evicted to bound memory
    pub evicts: bool,
}

/// Core trait for shard storage engines
///
/// Implementations are internally synchronized; one instance is shared by
/// every caller working on the same identifier.
pub trait ShardEngine: Send + Sync {
    /// Get engine capabilities
    fn capabilities(&self) -> EngineCapabilities;

    /// Read the value stored under `key`
    ///
    /// Fails with [`Error::KeyNotFound`] when the key is absent.
    fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Read the value stored under `key`, mapping a missing key to `None`
    ///
    /// Every other error is returned unchanged.
    fn get_bytes_safe(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get_bytes(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert or overwrite the value stored under `key`
    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Number of entries in the shard
    ///
    /// Namespace shards fail with [`Error::NamespaceNotFound`] when their
    /// namespace was never created.
    fn len(&self) -> Result<usize>;

    /// Whether the shard holds no entries
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every key in the shard
    fn keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Release the shard
    ///
    /// Reclaims space where the engine supports it, then drops the
    /// underlying handle. Calls after the first succeed without effect.
    fn close(&self) -> Result<()>;

    /// Whether [`close`](Self::close) has run
    fn is_closed(&self) -> bool;

    /// On-disk location, or `"RAM"` for non-persistent engines
    fn db_file_name(&self) -> String;
}

/// One database holding a namespace per identifier (shared layout)
pub trait SharedDatabase: Send + Sync {
    /// Engine this database runs on
    fn engine_type(&self) -> EngineType;

    /// Open the namespace for `identifier` if it exists
    fn open_namespace(&self, identifier: &Identifier) -> Result<Option<Arc<dyn ShardEngine>>>;

    /// Open the namespace for `identifier`, creating it if absent
    fn create_namespace(&self, identifier: &Identifier) -> Result<Arc<dyn ShardEngine>>;

    /// Identifiers that have a namespace
    fn namespaces(&self) -> Result<Vec<String>>;

    /// Release the database; idempotent
    fn close(&self) -> Result<()>;

    /// On-disk location of the database
    fn db_file_name(&self) -> String;
}

/// Shard name for `identifier` when its plain shard name is already taken
///
/// Scheme stripping makes `http://x` and `https://x` share a shard name; the
/// second one to be created gets a digest suffix.
pub(crate) fn disambiguated_name(identifier: &Identifier) -> String {
    let digest = hex::encode(Sha256::digest(identifier.as_str().as_bytes()));
    format!("{}-{}", identifier.shard_name(), &digest[..16])
}

/// Reject keys the embedded engines cannot store
pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("shard keys must not be empty"));
    }
    Ok(())
}

// Re-exports
pub use self::factory::{EngineConfig, EngineFactory};
pub use self::fjall::{FjallNamespace, FjallShard, FjallShared};
pub use self::memory::MemoryShard;
pub use self::redb::{RedbNamespace, RedbShard, RedbShared};
