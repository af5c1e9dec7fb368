//! Persistence for named calculation states: one opaque blob per name, with
//! a file-backed default and an in-memory variant sharing the same codec.

use std::fmt;

use async_trait::async_trait;
use shared::domain::CalculationState;
use thiserror::Error;

pub mod codec;
mod file_store;
mod locks;
mod memory_store;
mod names;

pub use codec::CodecError;
pub use file_store::FileStore;
pub use locks::NameLocks;
pub use memory_store::MemoryStore;
pub use names::{validate_name, MAX_NAME_BYTES};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("calculation '{0}' does not exist")]
    NotFound(String),
    #[error("calculation '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid calculation name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("failed to decode calculation '{name}': {source}")]
    Codec {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("storage io failure for '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    fn io(name: &str, source: std::io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            source,
        }
    }

    fn codec(name: &str, source: CodecError) -> Self {
        Self::Codec {
            name: name.to_string(),
            source,
        }
    }
}

/// Where a blob lives, for reporting back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation(String);

impl StoreLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait CalculationStore: Send + Sync {
    /// Persist a fresh state under `name`; fails if one already exists.
    async fn create(&self, name: &str) -> Result<StoreLocation, StoreError>;
    async fn load(&self, name: &str) -> Result<CalculationState, StoreError>;
    /// Replace the blob for `name`. The previous blob survives any failure.
    async fn save(&self, name: &str, state: &CalculationState) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<StoreLocation, StoreError>;
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
