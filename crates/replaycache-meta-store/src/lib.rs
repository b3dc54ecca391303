//! ReplayCache Metadata Store - sharded response cache
//!
//! Maps each cache identifier (request URL) to its own storage shard,
//! keeps open shard handles in a registry, and addresses entries inside a
//! shard by a digest of the request body.

pub mod control;
pub mod engine;
pub mod handles;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use control::{ControlIndex, CreationGuard, ShardOpener};
pub use engine::{EngineConfig, EngineFactory, SharedDatabase, ShardEngine};
pub use handles::ShardHandleCache;
pub use store::{MetaStore, ResponseStore};
pub use types::{ControlRecord, StoreStats};
