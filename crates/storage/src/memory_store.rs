use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use shared::domain::CalculationState;
use tokio::sync::RwLock;

use crate::{codec, validate_name, CalculationStore, StoreError, StoreLocation};

/// Keeps encoded blobs in memory; cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn location(name: &str) -> StoreLocation {
        StoreLocation::new(format!("memory://{name}"))
    }
}

#[async_trait]
impl CalculationStore for MemoryStore {
    async fn create(&self, name: &str) -> Result<StoreLocation, StoreError> {
        validate_name(name)?;
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let bytes = codec::encode(&CalculationState::new(name))
            .map_err(|source| StoreError::codec(name, source))?;
        blobs.insert(name.to_string(), bytes);
        Ok(Self::location(name))
    }

    async fn load(&self, name: &str) -> Result<CalculationState, StoreError> {
        validate_name(name)?;
        let blobs = self.blobs.read().await;
        let bytes = blobs
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        codec::decode(name, bytes).map_err(|source| StoreError::codec(name, source))
    }

    async fn save(&self, name: &str, state: &CalculationState) -> Result<(), StoreError> {
        validate_name(name)?;
        let bytes = codec::encode(state).map_err(|source| StoreError::codec(name, source))?;
        self.blobs.write().await.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<StoreLocation, StoreError> {
        validate_name(name)?;
        self.blobs
            .write()
            .await
            .remove(name)
            .map(|_| Self::location(name))
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(self.blobs.read().await.contains_key(name))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}
