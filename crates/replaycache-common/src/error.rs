//! Error types for ReplayCache
//!
//! This module defines the common error type used by the cache store,
//! its storage engines and the command line tools.

use crate::types::IdentifierError;
use std::fmt;
use thiserror::Error;

/// Common result type for ReplayCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ReplayCache
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to open engine at {path}: {reason}")]
    EngineOpen { path: String, reason: String },

    #[error("engine is closed: {0}")]
    EngineClosed(String),

    // Lookup errors
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("key not found")]
    KeyNotFound,

    // Lifecycle errors
    #[error("store closed")]
    StoreClosed,

    #[error("failed to close {count} shard(s): {list}", count = .0.len(), list = FailureList(.0))]
    CloseFailed(Vec<ShardCloseFailure>),

    #[error("{op} failed for {identifier}: {source}")]
    Shard {
        identifier: String,
        op: &'static str,
        source: Box<Error>,
    },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap an error with the identifier and operation it happened in
    pub fn shard(identifier: impl Into<String>, op: &'static str, source: Self) -> Self {
        Self::Shard {
            identifier: identifier.into(),
            op,
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `Shard` context wrappers
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Shard { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is an engine level missing-key signal
    #[must_use]
    pub fn is_key_not_found(&self) -> bool {
        matches!(self.root(), Self::KeyNotFound)
    }

    /// Check if this is a missing namespace in a shared database
    #[must_use]
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self.root(), Self::NamespaceNotFound(_))
    }

    /// Check if this is any kind of not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::KeyNotFound | Self::ShardNotFound(_) | Self::NamespaceNotFound(_)
        )
    }
}

/// A single shard that failed to close during store shutdown
#[derive(Debug)]
pub struct ShardCloseFailure {
    /// Identifier the shard belongs to
    pub identifier: String,
    /// The close error
    pub error: Error,
}

impl fmt::Display for ShardCloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identifier, self.error)
    }
}

struct FailureList<'a>(&'a [ShardCloseFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
