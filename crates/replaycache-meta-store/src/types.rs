//! Stored types for the control index and store statistics.
//!
//! Control records are serialized into the control index via bincode.

use replaycache_common::{EngineType, Error, KeyAlgorithm, Layout, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where the shard of one identifier lives (per-identifier layout)
///
/// `shard_name` is relative to the cache dir, so a moved cache dir keeps
/// its mapping. Written once when the shard is created and never modified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub identifier: String,
    pub shard_name: String,
    pub engine: EngineType,
    pub created_at_ms: u64,
}

impl ControlRecord {
    /// New record stamped with the current time
    pub fn new(
        identifier: impl Into<String>,
        shard_name: impl Into<String>,
        engine: EngineType,
    ) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            identifier: identifier.into(),
            shard_name: shard_name.into(),
            engine,
            created_at_ms,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Store statistics
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    /// Engine backing every shard
    pub engine: EngineType,
    /// Shard layout
    pub layout: Layout,
    /// Secondary key digest
    pub key_algorithm: KeyAlgorithm,
    /// Control index or shared database location
    pub location: String,
    /// Identifiers with a shard
    pub known_identifiers: usize,
    /// Shards currently open in this process
    pub open_shards: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_record_codec() {
        let record = ControlRecord::new(
            "http://example.com/test",
            "ZXhhbXBsZS5jb20vdGVzdA",
            EngineType::EmbeddedOrdered,
        );
        assert!(record.created_at_ms > 0);

        let decoded = ControlRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert!(ControlRecord::decode(b"").is_err());
    }
}
