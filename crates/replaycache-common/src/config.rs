//! Configuration types for ReplayCache
//!
//! This module defines the configuration file model shared by the cache
//! store and the command line tools.

use crate::error::{Error, Result};
use crate::key::KeyAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Root configuration for ReplayCache
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cache store configuration
    #[serde(default)]
    pub cache: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Check the configuration for unsupported combinations
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()
    }
}

/// Storage engine backing each shard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineType {
    /// Ordered B-tree store (redb)
    #[default]
    #[serde(alias = "redb")]
    EmbeddedOrdered,
    /// Log-structured merge store (fjall)
    #[serde(alias = "fjall")]
    EmbeddedLsm,
    /// Bounded in-memory LRU, not persisted
    #[serde(alias = "memory")]
    InMemory,
}

impl EngineType {
    /// Get the engine type name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EmbeddedOrdered => "embedded-ordered",
            Self::EmbeddedLsm => "embedded-lsm",
            Self::InMemory => "in-memory",
        }
    }

    /// Whether shards of this engine survive a restart
    pub const fn is_persistent(&self) -> bool {
        !matches!(self, Self::InMemory)
    }

    /// Default file name of the shared database for this engine
    pub const fn default_db_file_name(&self) -> &'static str {
        match self {
            Self::EmbeddedOrdered => "cache.redb",
            Self::EmbeddedLsm => "cache.fjall",
            Self::InMemory => "RAM",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "embedded-ordered" | "ordered" | "redb" => Ok(Self::EmbeddedOrdered),
            "embedded-lsm" | "lsm" | "fjall" => Ok(Self::EmbeddedLsm),
            "in-memory" | "memory" | "ram" => Ok(Self::InMemory),
            _ => Err(format!("unknown engine type: {}", s)),
        }
    }
}

/// How shards are laid out on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// One database per identifier plus a control index database
    #[default]
    PerIdentifier,
    /// One shared database with a namespace per identifier
    Shared,
}

impl Layout {
    /// Get the layout name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PerIdentifier => "per-identifier",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-identifier" | "per_identifier" | "file-per-identifier" => Ok(Self::PerIdentifier),
            "shared" | "buckets" | "namespaces" => Ok(Self::Shared),
            _ => Err(format!("unknown layout: {}", s)),
        }
    }
}

/// Cache store configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every shard and the control index
    pub dir: PathBuf,
    /// Storage engine for shards
    pub engine: EngineType,
    /// Shard layout
    pub layout: Layout,
    /// Shared database file name (shared layout only)
    pub db_file_name: Option<String>,
    /// Secondary key digest
    pub key_algorithm: KeyAlgorithm,
    /// Entry limit per shard for the in-memory engine
    pub memory_capacity: usize,
    /// Block cache size for the LSM engine, in bytes
    pub lsm_cache_size: u64,
    /// Reclaim space when a shard is closed
    pub compact_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            engine: EngineType::default(),
            layout: Layout::default(),
            db_file_name: None,
            key_algorithm: KeyAlgorithm::default(),
            memory_capacity: 10_000,
            lsm_cache_size: 16 * 1024 * 1024, // 16 MB
            compact_on_close: true,
        }
    }
}

impl StoreConfig {
    /// Create config with cache directory
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the engine type
    #[must_use]
    pub const fn with_engine(mut self, engine: EngineType) -> Self {
        self.engine = engine;
        self
    }

    /// Set the layout
    #[must_use]
    pub const fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Shared database file name, defaulted from the engine type
    pub fn db_file_name(&self) -> &str {
        self.db_file_name
            .as_deref()
            .unwrap_or_else(|| self.engine.default_db_file_name())
    }

    /// Check for unsupported settings
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() && self.engine.is_persistent() {
            return Err(Error::configuration("cache dir must not be empty"));
        }
        if self.memory_capacity == 0 {
            return Err(Error::configuration("memory_capacity must be at least 1"));
        }
        if self.engine == EngineType::InMemory && self.layout == Layout::Shared {
            return Err(Error::configuration(
                "the in-memory engine only supports the per-identifier layout",
            ));
        }
        if let Some(name) = &self.db_file_name
            && (name.is_empty() || name == "control")
        {
            return Err(Error::configuration(format!(
                "invalid db_file_name: {name:?}"
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.engine, EngineType::EmbeddedOrdered);
        assert_eq!(config.cache.layout, Layout::PerIdentifier);
        assert_eq!(config.cache.db_file_name(), "cache.redb");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            dir = "/var/cache/replay"
            engine = "fjall"
            layout = "shared"
            key_algorithm = "sha512"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/replay"));
        assert_eq!(config.cache.engine, EngineType::EmbeddedLsm);
        assert_eq!(config.cache.layout, Layout::Shared);
        assert_eq!(config.cache.key_algorithm, KeyAlgorithm::Sha512);
        assert_eq!(config.cache.db_file_name(), "cache.fjall");
        assert_eq!(config.cache.memory_capacity, 10_000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_rejects_memory_shared() {
        let err = Config::from_toml_str(
            r#"
            [cache]
            engine = "in-memory"
            layout = "shared"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());

        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "[cache]\nmemory_capacity = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_engine_type_parse() {
        assert_eq!("redb".parse::<EngineType>(), Ok(EngineType::EmbeddedOrdered));
        assert_eq!("embedded-lsm".parse::<EngineType>(), Ok(EngineType::EmbeddedLsm));
        assert_eq!("RAM".parse::<EngineType>(), Ok(EngineType::InMemory));
        assert!("sqlite".parse::<EngineType>().is_err());
        assert_eq!("shared".parse::<Layout>(), Ok(Layout::Shared));
    }
}
