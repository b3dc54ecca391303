//! ReplayCache Common - Shared types and utilities
//!
//! This crate provides the error type, configuration model, secondary key
//! codec and response value codec used by the cache store and its tools.

pub mod config;
pub mod error;
pub mod key;
pub mod types;

pub use config::{Config, EngineType, Layout, LoggingConfig, StoreConfig};
pub use error::{Error, Result, ShardCloseFailure};
pub use key::{KeyAlgorithm, KeyCodec, SecondaryKey};
pub use types::*;
