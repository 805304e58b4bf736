//! Shared library for the comic API client workspace.
//!
//! This crate provides common functionality used by the client crate:
//! - Configuration management
//! - Persistent key/value storage for the cache
//! - Logging infrastructure

pub mod config;
pub mod logging;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use logging::LogConfig;
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StoreError};

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
