//! Per-user preference key/value store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get(&self, user_id: Uuid, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, user_id: Uuid, key: &str, value: serde_json::Value) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceRepository {
    values: RwLock<HashMap<(Uuid, String), serde_json::Value>>,
}

impl InMemoryPreferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceRepository for InMemoryPreferenceRepository {
    async fn get(&self, user_id: Uuid, key: &str) -> Result<Option<serde_json::Value>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::StorageError("preference store lock poisoned".to_string()))?;
        Ok(values.get(&(user_id, key.to_string())).cloned())
    }

    async fn set(&self, user_id: Uuid, key: &str, value: serde_json::Value) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("preference key cannot be empty".to_string()));
        }
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::StorageError("preference store lock poisoned".to_string()))?;
        values.insert((user_id, key.to_string()), value);
        Ok(())
    }
}
