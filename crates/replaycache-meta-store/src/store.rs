//! Sharded response cache store.
//!
//! `MetaStore` resolves each identifier to its shard, creating the shard on
//! first use, and reads or writes the entry addressed by the digest of the
//! request body. Open shards are kept in a [`ShardHandleCache`] so steady
//! state traffic never touches the creation mutex. `close` shuts every shard
//! down in parallel and reports all failures together.

use crate::control::{ControlIndex, ShardOpener};
use crate::engine::ShardEngine;
use crate::handles::ShardHandleCache;
use crate::types::StoreStats;
use replaycache_common::{
    CachedResponse, Error, Identifier, KeyCodec, Layout, Result, ShardCloseFailure, StoreConfig,
};
use crossbeam_channel::{Receiver, Sender};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

/// Label used for the control index in close failures
const CONTROL_INDEX_LABEL: &str = "<control index>";

/// Attempts at an operation whose shard keeps being evicted underneath it
const MAX_SHARD_ATTEMPTS: usize = 8;

type CloseJob<'a> = (&'a Identifier, &'a Arc<dyn ShardEngine>);

/// Interface the proxy layer caches responses through
pub trait ResponseStore: Send + Sync {
    /// Recorded value for the request, `None` on a cache miss
    fn lookup(&self, identifier: &str, body: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Record `value` for the request
    fn store(&self, identifier: &str, body: &[u8], value: &[u8]) -> Result<()>;

    /// Recorded response for the request, decoded
    fn lookup_response(&self, identifier: &str, body: &[u8]) -> Result<Option<CachedResponse>> {
        self.lookup(identifier, body)?
            .map(|bytes| CachedResponse::decode(&bytes))
            .transpose()
    }

    /// Record `response` for the request
    fn store_response(
        &self,
        identifier: &str,
        body: &[u8],
        response: &CachedResponse,
    ) -> Result<()> {
        self.store(identifier, body, &response.encode()?)
    }
}

/// Sharded response cache store
pub struct MetaStore {
    config: StoreConfig,
    codec: KeyCodec,
    control: ControlIndex,
    handles: ShardHandleCache,
    closed: AtomicBool,
}

impl MetaStore {
    /// Open (or create) the store described by `config`
    pub fn open(config: StoreConfig) -> Result<Self> {
        let control = ControlIndex::open(&config)?;
        Ok(Self::from_control(config, control))
    }

    /// Open the store, opening per-identifier shards with `opener`
    pub fn with_opener(config: StoreConfig, opener: ShardOpener) -> Result<Self> {
        let control = ControlIndex::with_opener(&config, opener)?;
        Ok(Self::from_control(config, control))
    }

    fn from_control(config: StoreConfig, control: ControlIndex) -> Self {
        info!(
            "Opened cache store at {} (engine: {}, layout: {}, keys: {})",
            control.location(),
            config.engine,
            config.layout,
            config.key_algorithm
        );
        Self {
            codec: KeyCodec::new(config.key_algorithm),
            config,
            control,
            handles: ShardHandleCache::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Recorded value for `(identifier, body)`, `None` on a miss
    ///
    /// The first access to an identifier provisions its shard.
    pub fn get(&self, identifier: &str, body: &[u8]) -> Result<Option<Vec<u8>>> {
        let identifier = self.check(identifier)?;
        let key = self.codec.derive(body);
        let found = self.with_shard(&identifier, true, |shard| {
            shard.get_bytes_safe(key.as_bytes())
        });
        match found.map(Option::flatten) {
            Ok(value) => {
                debug!(
                    "Cache {} for {} ({})",
                    if value.is_some() { "hit" } else { "miss" },
                    identifier,
                    key.to_hex()
                );
                Ok(value)
            }
            Err(Error::NamespaceNotFound(_)) => Ok(None),
            Err(e) => Err(self.op_error(&identifier, "get", e)),
        }
    }

    /// Record `value` for `(identifier, body)`, overwriting any previous one
    pub fn put(&self, identifier: &str, body: &[u8], value: &[u8]) -> Result<()> {
        let identifier = self.check(identifier)?;
        let key = self.codec.derive(body);
        self.with_shard(&identifier, true, |shard| {
            shard.set_bytes(key.as_bytes(), value)
        })
        .map_err(|e| self.op_error(&identifier, "put", e))?;
        debug!("Stored {} bytes for {} ({})", value.len(), identifier, key.to_hex());
        Ok(())
    }

    /// Number of entries recorded for `identifier`
    ///
    /// Does not provision a shard: an identifier that was never accessed
    /// fails with `ShardNotFound` (per-identifier layout) or
    /// `NamespaceNotFound` (shared layout).
    pub fn len(&self, identifier: &str) -> Result<usize> {
        let identifier = self.check(identifier)?;
        let len = self
            .with_shard(&identifier, false, |shard| shard.len())
            .map_err(|e| self.op_error(&identifier, "len", e))?;
        len.ok_or_else(|| match self.control.layout() {
            Layout::PerIdentifier => Error::ShardNotFound(identifier.to_string()),
            Layout::Shared => Error::NamespaceNotFound(identifier.to_string()),
        })
    }

    /// Remove the entry for `(identifier, body)`; absent entries are ignored
    pub fn delete(&self, identifier: &str, body: &[u8]) -> Result<()> {
        let identifier = self.check(identifier)?;
        let key = self.codec.derive(body);
        match self.with_shard(&identifier, false, |shard| shard.delete(key.as_bytes())) {
            Ok(_) | Err(Error::NamespaceNotFound(_)) => Ok(()),
            Err(e) => Err(self.op_error(&identifier, "delete", e)),
        }
    }

    /// Close the open handle of `identifier`, keeping its data
    ///
    /// The next access reopens the shard. Returns whether a handle was open.
    /// Shards of the in-memory engine lose their entries.
    pub fn evict(&self, identifier: &str) -> Result<bool> {
        let identifier = self.check(identifier)?;
        // Held so no one reopens the shard while it is still closing
        let _guard = self.control.lock_creation();
        let Some(shard) = self.handles.delete(&identifier) else {
            return Ok(false);
        };
        shard
            .close()
            .map_err(|e| Error::shard(identifier.as_str(), "evict", e))?;
        debug!("Evicted shard handle for {}", identifier);
        Ok(true)
    }

    /// Number of shards currently open
    pub fn open_shards(&self) -> usize {
        self.handles.len()
    }

    /// Identifiers that have a shard
    pub fn identifiers(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.control.identifiers()
    }

    /// Store statistics
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            engine: self.config.engine,
            layout: self.config.layout,
            key_algorithm: self.codec.algorithm(),
            location: self.control.location(),
            known_identifiers: self.identifiers()?.len(),
            open_shards: self.open_shards(),
        })
    }

    /// Configuration the store was opened with
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every shard, then the control index
    ///
    /// Shards are closed in parallel by at most `available_parallelism`
    /// threads and every one is attempted even if others fail; all failures
    /// are returned together. Only the first call does anything.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // No shard can be created once the flag is set and this lock is
        // released, so the drained set is final.
        let shards = {
            let _guard = self.control.lock_creation();
            self.handles.drain()
        };
        info!("Closing cache store ({} open shards)", shards.len());

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<CloseJob<'_>>();
        for job in &shards {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let workers = thread::available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .min(shards.len());
        let (failure_tx, failure_rx) = crossbeam_channel::unbounded();
        thread::scope(|scope| {
            // The calling thread works the queue too, so every shard is
            // closed even if no worker can be spawned.
            for n in 1..workers {
                let jobs = job_rx.clone();
                let failures = failure_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("shard-close-{n}"))
                    .spawn_scoped(scope, move || close_shards(&jobs, &failures));
                if let Err(e) = spawned {
                    warn!("Failed to spawn shard close worker: {}", e);
                    break;
                }
            }
            close_shards(&job_rx, &failure_tx);
        });
        drop(failure_tx);
        let mut failures: Vec<ShardCloseFailure> = failure_rx.try_iter().collect();
        failures.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        if let Err(error) = self.control.close() {
            warn!("Failed to close control index: {}", error);
            failures.push(ShardCloseFailure {
                identifier: CONTROL_INDEX_LABEL.to_string(),
                error,
            });
        }

        if failures.is_empty() {
            info!("Cache store closed");
            Ok(())
        } else {
            Err(Error::CloseFailed(failures))
        }
    }

    fn check(&self, identifier: &str) -> Result<Identifier> {
        self.ensure_open()?;
        Ok(Identifier::new(identifier)?)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    /// Open shard of `identifier`
    ///
    /// With `provision` a missing shard is created, otherwise `None` is
    /// returned for an identifier that has none.
    fn shard(
        &self,
        identifier: &Identifier,
        provision: bool,
    ) -> Result<Option<Arc<dyn ShardEngine>>> {
        if let Some(shard) = self.handles.get(identifier) {
            return Ok(Some(shard));
        }

        let guard = self.control.lock_creation();
        self.ensure_open()?;
        if let Some(shard) = self.handles.get(identifier) {
            return Ok(Some(shard));
        }
        let shard = if provision {
            self.control.resolve_or_create(&guard, identifier).map(Some)
        } else {
            self.control.resolve(&guard, identifier)
        }
        .map_err(|e| Error::shard(identifier.as_str(), "open", e))?;
        if let Some(shard) = &shard {
            self.handles.put(identifier.clone(), Arc::clone(shard));
        }
        Ok(shard)
    }

    /// Run `op` against the shard of `identifier`
    ///
    /// A handle evicted between lookup and use is reopened and `op` runs
    /// again. `None` when the identifier has no shard and `provision` is off.
    fn with_shard<T>(
        &self,
        identifier: &Identifier,
        provision: bool,
        op: impl Fn(&dyn ShardEngine) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut attempt = 1;
        loop {
            let Some(shard) = self.shard(identifier, provision)? else {
                return Ok(None);
            };
            match op(shard.as_ref()) {
                Err(Error::EngineClosed(_))
                    if !self.is_closed() && attempt < MAX_SHARD_ATTEMPTS =>
                {
                    debug!("Shard for {} closed mid-operation, reopening", identifier);
                    attempt += 1;
                }
                result => return result.map(Some),
            }
        }
    }

    /// Attach context to a shard operation failure
    ///
    /// A shard closed underneath a caller by a concurrent `close` reports
    /// `StoreClosed` rather than the engine error. Errors that already carry
    /// context pass through unchanged.
    fn op_error(&self, identifier: &Identifier, op: &'static str, e: Error) -> Error {
        match e {
            Error::StoreClosed | Error::Shard { .. } => e,
            Error::EngineClosed(_) if self.is_closed() => Error::StoreClosed,
            e => Error::shard(identifier.as_str(), op, e),
        }
    }
}

/// Close queued shards until the queue is empty
fn close_shards(jobs: &Receiver<CloseJob<'_>>, failures: &Sender<ShardCloseFailure>) {
    for (identifier, shard) in jobs {
        if let Err(error) = shard.close() {
            warn!("Failed to close shard for {}: {}", identifier, error);
            let _ = failures.send(ShardCloseFailure {
                identifier: identifier.to_string(),
                error,
            });
        }
    }
}

impl ResponseStore for MetaStore {
    fn lookup(&self, identifier: &str, body: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(identifier, body)
    }

    fn store(&self, identifier: &str, body: &[u8], value: &[u8]) -> Result<()> {
        self.put(identifier, body, value)
    }
}

impl Drop for MetaStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close cache store on drop: {}", e);
        }
    }
}
