//! Core type definitions for ReplayCache
//!
//! This module defines the cache identifier, the filesystem-safe shard
//! name derived from it, and the cached response value format.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Longest shard name used verbatim
pub const MAX_SHARD_NAME_LEN: usize = 200;

/// Prefix kept from an over-long shard name before the digest suffix
const SHARD_NAME_PREFIX_LEN: usize = 128;

/// Hex characters of the identifier digest appended to over-long names
const SHARD_NAME_DIGEST_LEN: usize = 32;

/// Primary cache key, normally the normalized absolute request URL
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Identifier(String);

impl Identifier {
    /// Create a new identifier (must be non-empty)
    pub fn new(identifier: impl Into<String>) -> std::result::Result<Self, IdentifierError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if identifier.trim().is_empty() {
            return Err(IdentifierError::Blank);
        }
        Ok(Self(identifier))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem and namespace safe name of the shard for this identifier
    ///
    /// URL-safe base64 of the identifier with its `scheme://` prefix
    /// stripped. Names longer than [`MAX_SHARD_NAME_LEN`] are shortened and
    /// suffixed with a digest of the full identifier.
    #[must_use]
    pub fn shard_name(&self) -> String {
        let stripped = self
            .0
            .split_once("://")
            .map_or(self.0.as_str(), |(_, rest)| rest);
        let encoded = URL_SAFE_NO_PAD.encode(stripped.as_bytes());
        if encoded.len() <= MAX_SHARD_NAME_LEN {
            return encoded;
        }

        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        format!(
            "{}-{}",
            &encoded[..SHARD_NAME_PREFIX_LEN],
            &digest[..SHARD_NAME_DIGEST_LEN]
        )
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({:?})", self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Errors that can occur when creating an identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier must not be blank")]
    Blank,
}

/// A recorded HTTP response as stored in the cache
///
/// The store treats entry values as opaque bytes; this is the encoding the
/// proxy layer uses for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers in received order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Create a response with no headers
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Drop headers whose name matches any of `filtered` (case-insensitive)
    #[must_use]
    pub fn without_headers<S: AsRef<str>>(mut self, filtered: &[S]) -> Self {
        self.headers.retain(|(name, _)| {
            !filtered
                .iter()
                .any(|f| f.as_ref().eq_ignore_ascii_case(name))
        });
        self
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a stored value
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
