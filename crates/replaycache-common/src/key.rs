//! Secondary key codec
//!
//! A shard holds every recorded response for one identifier; within the
//! shard, entries are addressed by a digest of the request body. Storage
//! engines reject empty keys, so an empty body is hashed as the single
//! space sentinel [`EMPTY_BODY_SENTINEL`] instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::sync::OnceLock;

/// Stand-in for an empty request body
pub const EMPTY_BODY_SENTINEL: &[u8] = b" ";

/// Digest algorithm used to derive secondary keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// SHA-256 (32 byte keys)
    #[default]
    Sha256,
    /// SHA-512 (64 byte keys)
    Sha512,
}

impl KeyAlgorithm {
    /// Get the algorithm name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the produced digest in bytes
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(format!("unknown key algorithm: {}", s)),
        }
    }
}

/// Derives secondary keys from request bodies
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyCodec {
    algorithm: KeyAlgorithm,
}

impl KeyCodec {
    /// Create a codec for the given algorithm
    #[must_use]
    pub const fn new(algorithm: KeyAlgorithm) -> Self {
        Self { algorithm }
    }

    /// The configured algorithm
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Derive the secondary key for `raw`
    ///
    /// The digest itself is computed lazily, once per returned key.
    #[must_use]
    pub fn derive(&self, raw: &[u8]) -> SecondaryKey {
        let raw = if raw.is_empty() {
            EMPTY_BODY_SENTINEL
        } else {
            raw
        };
        SecondaryKey {
            algorithm: self.algorithm,
            raw: raw.to_vec(),
            digest: OnceLock::new(),
        }
    }
}

/// Content-derived key of an entry inside a shard
#[derive(Clone)]
pub struct SecondaryKey {
    algorithm: KeyAlgorithm,
    raw: Vec<u8>,
    digest: OnceLock<Vec<u8>>,
}

impl SecondaryKey {
    /// Digest bytes, computed on first access
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.digest.get_or_init(|| self.algorithm.digest(&self.raw))
    }

    /// Lowercase hex of the digest
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Algorithm this key was derived with
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Whether the digest has been computed yet
    #[must_use]
    pub fn is_computed(&self) -> bool {
        self.digest.get().is_some()
    }
}

impl PartialEq for SecondaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SecondaryKey {}

impl AsRef<[u8]> for SecondaryKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for SecondaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecondaryKey({}:{})", self.algorithm, self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let codec = KeyCodec::default();
        let a = codec.derive(b"hello");
        let b = codec.derive(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, codec.derive(b"different"));
        assert_eq!(
            a.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_empty_body_uses_sentinel() {
        let codec = KeyCodec::default();
        let empty = codec.derive(b"");
        assert!(!empty.as_bytes().is_empty());
        assert_eq!(empty, codec.derive(b" "));
        assert_eq!(
            empty.to_hex(),
            "36a9e7f1c95b82ffb99743e0c5c4ce95d83c9a430aac59f84ef3cbfab6145068"
        );
    }

    #[test]
    fn test_digest_is_memoized() {
        let key = KeyCodec::new(KeyAlgorithm::Sha512).derive(b"body");
        assert!(!key.is_computed());
        let first = key.as_bytes().as_ptr();
        assert!(key.is_computed());
        assert_eq!(key.as_bytes().as_ptr(), first);
        assert_eq!(key.as_bytes().len(), KeyAlgorithm::Sha512.digest_len());
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("sha256".parse::<KeyAlgorithm>(), Ok(KeyAlgorithm::Sha256));
        assert_eq!("SHA-512".parse::<KeyAlgorithm>(), Ok(KeyAlgorithm::Sha512));
        assert!("md5".parse::<KeyAlgorithm>().is_err());
        assert_eq!(KeyAlgorithm::Sha512.to_string(), "sha512");
    }
}
