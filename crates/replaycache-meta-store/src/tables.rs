//! Table and partition names used inside the embedded databases.

use redb::TableDefinition;

// Entries of a standalone shard (and of the control index, which is a
// shard keyed by identifier)
pub const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

// LSM partition holding the entries of a standalone shard
pub const ENTRIES_PARTITION: &str = "entries";

// LSM partition mapping identifier -> namespace partition name in a shared
// keyspace. `$` never appears in base64url shard names.
pub const NAMESPACE_CATALOG: &str = "$namespaces";

// Directory / file name of the control index under the cache dir
pub const CONTROL_INDEX_NAME: &str = "control";

// Reported as the location of non-persistent engines
pub const RAM: &str = "RAM";
